//! dylibify - converts Mach-O executables into loadable dylibs.
//!
//! Turn a standalone executable into a dylib that other binaries can link
//! against and load, optionally dropping dependencies along the way.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use dylibify::{dylibify_with_options, DylibifyOptions, TargetPlatform};

/// Converts a Mach-O executable into a loadable dylib.
#[derive(Parser, Debug)]
#[command(name = "dylibify")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input Mach-O executable (thin or fat)
    #[arg(short, long)]
    input: PathBuf,

    /// Output path for the converted dylib
    #[arg(short, long)]
    output: PathBuf,

    /// Install name to declare (default: @executable_path/<output name>)
    #[arg(short, long)]
    dylib_path: Option<String>,

    /// Remove a dependent dylib by its declared path (repeatable).
    /// Symbols left dangling are repointed at a compiled stub dylib.
    #[arg(short, long = "remove-dylib")]
    remove_dylib: Vec<String>,

    /// Remove every dependency the host loader cannot resolve
    #[arg(short = 'R', long)]
    auto_remove_dylibs: bool,

    /// Remove the embedded __TEXT,__info_plist section
    #[arg(short = 'P', long)]
    remove_info_plist: bool,

    /// Declare the output as an iOS dylib
    #[arg(short = 'I', long, conflicts_with = "macos")]
    ios: bool,

    /// Declare the output as a macOS dylib
    #[arg(short = 'M', long)]
    macos: bool,

    /// Increase verbosity (repeatable; default shows warnings)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbosity = cli.verbose.saturating_add(1);
    setup_logging(verbosity);

    let start = Instant::now();

    if let Some(parent) = cli.output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    let platform = if cli.ios {
        Some(TargetPlatform::Ios)
    } else if cli.macos {
        Some(TargetPlatform::Macos)
    } else {
        None
    };

    let options = DylibifyOptions {
        dylib_path: cli.dylib_path,
        remove_dylibs: cli.remove_dylib,
        auto_remove_dylibs: cli.auto_remove_dylibs,
        remove_info_plist: cli.remove_info_plist,
        platform,
        verbosity,
        ..DylibifyOptions::default()
    };

    dylibify_with_options(&cli.input, &cli.output, &options)
        .with_context(|| format!("Failed to convert: {}", cli.input.display()))?;

    info!(
        "Converted {} -> {} in {:.2}s",
        cli.input.display(),
        cli.output.display(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}
