//! Fusing thin stub dylibs into one universal artifact.
//!
//! Each architecture slice compiles its own thin stub; the converted image's
//! stub `LC_LOAD_DYLIB` points at a single path, so the thin artifacts are
//! fused with `lipo -create` into one file next to the output image. Runs
//! once per conversion, and not at all when no slice needed a stub.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use super::toolchain::run_tool;
use crate::error::Result;

/// Builds the lipo argument vector.
pub fn lipo_argv(thins: &[PathBuf], fat: &Path) -> Vec<String> {
    let mut args = vec![
        "-create".to_string(),
        "-output".to_string(),
        fat.display().to_string(),
    ];
    args.extend(thins.iter().map(|p| p.display().to_string()));
    args
}

/// Fuses the thin stub dylibs into `fat`.
pub fn fuse_stubs(thins: &[PathBuf], fat: &Path, timeout: Duration) -> Result<()> {
    run_tool("lipo", &lipo_argv(thins, fat), timeout)?;
    info!("fused {} stub slice(s) into {}", thins.len(), fat.display());
    Ok(())
}
