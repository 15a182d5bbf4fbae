//! External toolchain process runner.
//!
//! Stub compilation and fat assembly shell out to `clang` and `lipo`. Both
//! run through [`run_tool`], which captures stderr for error reporting and
//! enforces a wall-clock deadline so a wedged toolchain cannot hang the
//! conversion.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

/// Default wall-clock budget for one toolchain invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// How often a running tool is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs an external tool to completion.
///
/// The child's stderr is drained on a separate thread so a chatty tool can
/// never fill the pipe and deadlock the poll loop. A child still running at
/// the deadline is killed and reported as [`Error::ToolchainTimeout`]; a
/// non-zero exit is reported as [`Error::ToolchainFailure`] with whatever
/// stderr it produced.
pub fn run_tool(tool: &str, args: &[String], timeout: Duration) -> Result<()> {
    debug!("running {} {}", tool, args.join(" "));

    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::ToolchainSpawn {
            tool: tool.to_string(),
            source,
        })?;

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            if let Some(reader) = stderr_reader {
                let _ = reader.join();
            }
            return Err(Error::ToolchainTimeout {
                tool: tool.to_string(),
                secs: timeout.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stderr = stderr_reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();

    if !status.success() {
        return Err(Error::toolchain_failure(tool, status, stderr.trim()));
    }

    debug!("{} finished in {:?}", tool, start.elapsed());
    Ok(())
}
