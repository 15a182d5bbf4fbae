//! dylibify - converts Mach-O executables into loadable dylibs.
//!
//! This library rewrites a Mach-O executable image in place so that dyld
//! will accept it as a dependent library: the file type and flags change,
//! executable-only load commands go away, and an install name is declared.
//! Dependencies can be dropped in the same pass, and every library ordinal
//! in the bind streams and symbol table is rewritten so the surviving
//! references still resolve against the renumbered dependency list.
//!
//! # Features
//!
//! - Thin and fat (universal) input files
//! - Explicit and automatic dependency removal
//! - Stub dylib synthesis for symbols orphaned by a removal
//! - Both binding encodings: classic dyld info and symbol-table ordinals
//! - Platform retargeting (macOS <-> iOS)
//!
//! # Example
//!
//! ```no_run
//! use dylibify::dylibify;
//!
//! fn main() -> dylibify::Result<()> {
//!     // Convert a tool into a dylib other binaries can link against
//!     dylibify("build/tool", "build/libtool.dylib")?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod convert;
pub mod error;
pub mod macho;
mod util;

// Re-export main types
pub use convert::{convert_slice, SliceOutcome, StubRequest};
pub use error::{Error, Result};
pub use macho::MachImage;

use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

use memmap2::Mmap;
use rayon::prelude::*;
use tracing::debug;

use convert::{
    compile_stub, fuse_stubs, stub_install_name, DEFAULT_TOOL_TIMEOUT, STUB_BASENAME,
};
use macho::fat::{self, FatFile, FatMember};
use macho::MH_MAGIC_64;

/// Converts an executable into a dylib.
///
/// # Arguments
///
/// * `input` - Path of the Mach-O executable (thin or fat)
/// * `output` - Path where the converted dylib will be written
///
/// # Returns
///
/// Returns `Ok(())` on success, or an error if conversion fails. On error
/// nothing has been written to `output`.
pub fn dylibify<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Result<()> {
    dylibify_with_options(input, output, &DylibifyOptions::default())
}

/// Platform a converted dylib can be retargeted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlatform {
    /// macOS
    Macos,
    /// iOS
    Ios,
}

impl TargetPlatform {
    /// Returns the LC_BUILD_VERSION platform identifier.
    pub fn platform_id(self) -> u32 {
        match self {
            TargetPlatform::Macos => macho::PLATFORM_MACOS,
            TargetPlatform::Ios => macho::PLATFORM_IOS,
        }
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPlatform::Macos => f.write_str("macos"),
            TargetPlatform::Ios => f.write_str("ios"),
        }
    }
}

/// Options for executable-to-dylib conversion.
#[derive(Debug, Clone)]
pub struct DylibifyOptions {
    /// Install name to declare; defaults to `@executable_path/<output name>`
    pub dylib_path: Option<String>,
    /// Dependencies to remove, by their declared paths
    pub remove_dylibs: Vec<String>,
    /// Also remove every dependency the host loader cannot resolve
    pub auto_remove_dylibs: bool,
    /// Zero and unregister the embedded `__TEXT,__info_plist` section
    pub remove_info_plist: bool,
    /// Replace the image's platform declaration
    pub platform: Option<TargetPlatform>,
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    pub verbosity: u8,
    /// Time limit for each external tool invocation
    pub tool_timeout: Duration,
}

impl Default for DylibifyOptions {
    fn default() -> Self {
        Self {
            dylib_path: None,
            remove_dylibs: Vec::new(),
            auto_remove_dylibs: false,
            remove_info_plist: false,
            platform: None,
            verbosity: 1,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// Converts an executable into a dylib with custom options.
pub fn dylibify_with_options<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    options: &DylibifyOptions,
) -> Result<()> {
    let input = input.as_ref();
    let output = output.as_ref();

    let file = File::open(input).map_err(|source| Error::FileOpen {
        path: input.to_path_buf(),
        source,
    })?;
    // Safety: the mapping is read-only and dropped before this returns;
    // conversion never writes back to the input file.
    let mapped = unsafe { Mmap::map(&file) }.map_err(|source| Error::MemoryMap {
        path: input.to_path_buf(),
        source,
    })?;

    let identity = match &options.dylib_path {
        Some(path) => path.clone(),
        None => default_identity(output),
    };
    debug!(
        "converting {} -> {} with identity {}",
        input.display(),
        output.display(),
        identity
    );

    if fat::is_fat(&mapped) {
        convert_fat_file(&mapped, output, &identity, options)
    } else {
        convert_thin_file(&mapped, output, &identity, options)
    }
}

/// Converts a thin input and writes it out.
fn convert_thin_file(
    data: &[u8],
    output: &Path,
    identity: &str,
    options: &DylibifyOptions,
) -> Result<()> {
    let image = MachImage::parse(data)?;
    let outcome = convert_slice(image, identity, options)?;

    let requests: Vec<StubRequest> = outcome.stub.into_iter().collect();
    build_stub_dylib(&requests, output, identity, options)?;

    write_output(output, outcome.image.as_bytes())
}

/// Converts every member of a fat input and writes the reassembled
/// container out.
fn convert_fat_file(
    data: &[u8],
    output: &Path,
    identity: &str,
    options: &DylibifyOptions,
) -> Result<()> {
    let container = FatFile::parse(data)?;
    let mut members = Vec::with_capacity(container.arches.len());
    let mut requests = Vec::new();

    for arch in &container.arches {
        let slice = container.slice(data, arch)?;
        if slice.len() < 4 || util::read_u32_le(slice) != MH_MAGIC_64 {
            return Err(Error::FatMemberUnsupported {
                cputype: arch.cputype,
            });
        }

        let image = MachImage::parse(slice)?;
        let outcome = convert_slice(image, identity, options)?;
        if let Some(request) = outcome.stub {
            requests.push(request);
        }
        members.push(FatMember {
            arch: *arch,
            data: outcome.image.as_bytes().to_vec(),
        });
    }

    build_stub_dylib(&requests, output, identity, options)?;
    write_output(output, &fat::assemble(&members))
}

/// Compiles one stub dylib per requesting slice and fuses them into a
/// universal stub next to the output. No-op when nothing was orphaned.
fn build_stub_dylib(
    requests: &[StubRequest],
    output: &Path,
    identity: &str,
    options: &DylibifyOptions,
) -> Result<()> {
    if requests.is_empty() {
        return Ok(());
    }

    let install_name = stub_install_name(identity);
    let thins = requests
        .par_iter()
        .map(|request| compile_stub(request, output, &install_name, options.tool_timeout))
        .collect::<Result<Vec<_>>>()?;

    fuse_stubs(&thins, &output.with_file_name(STUB_BASENAME), options.tool_timeout)
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).map_err(|source| Error::FileWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Default install name: the output's file name resolved relative to the
/// loading executable.
fn default_identity(output: &Path) -> String {
    match output.file_name() {
        Some(name) => format!("@executable_path/{}", name.to_string_lossy()),
        None => format!("@executable_path/{}", output.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::fat::FatArch;
    use crate::macho::testutil::ImageBuilder;
    use crate::macho::{CPU_TYPE_X86_64, LC_ID_DYLIB, MH_DYLIB};

    #[test]
    fn test_default_identity() {
        assert_eq!(
            default_identity(Path::new("/tmp/out/libtool.dylib")),
            "@executable_path/libtool.dylib"
        );
        assert_eq!(
            default_identity(Path::new("libtool.dylib")),
            "@executable_path/libtool.dylib"
        );
    }

    #[test]
    fn test_dylibify_thin_file() {
        let data = ImageBuilder::new()
            .dylib("/usr/lib/libSystem.B.dylib")
            .undefined_symbol("_printf", 1)
            .dylinker()
            .main_entry()
            .build();

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tool");
        let output = dir.path().join("libtool.dylib");
        fs::write(&input, &data).unwrap();

        dylibify(&input, &output).unwrap();

        let converted = fs::read(&output).unwrap();
        let image = MachImage::parse(&converted).unwrap();
        assert!(image.header.is_dylib());
        assert_eq!(
            image.find_command(LC_ID_DYLIB).unwrap().dylib_name().unwrap(),
            "@executable_path/libtool.dylib"
        );
    }

    #[test]
    fn test_dylibify_fat_file() {
        let arm = ImageBuilder::new()
            .dylib("/usr/lib/libSystem.B.dylib")
            .main_entry()
            .build();
        let intel = ImageBuilder::new()
            .cpu(CPU_TYPE_X86_64, 3)
            .dylib("/usr/lib/libSystem.B.dylib")
            .main_entry()
            .build();
        let container = fat::assemble(&[
            FatMember {
                arch: FatArch {
                    cputype: crate::macho::CPU_TYPE_ARM64,
                    cpusubtype: 0,
                    offset: 0,
                    size: 0,
                    align: 14,
                },
                data: arm,
            },
            FatMember {
                arch: FatArch {
                    cputype: CPU_TYPE_X86_64,
                    cpusubtype: 3,
                    offset: 0,
                    size: 0,
                    align: 12,
                },
                data: intel,
            },
        ]);

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tool");
        let output = dir.path().join("libtool.dylib");
        fs::write(&input, &container).unwrap();

        let options = DylibifyOptions {
            dylib_path: Some("@rpath/libtool.dylib".to_string()),
            ..DylibifyOptions::default()
        };
        dylibify_with_options(&input, &output, &options).unwrap();

        let converted = fs::read(&output).unwrap();
        let reparsed = FatFile::parse(&converted).unwrap();
        assert_eq!(reparsed.arches.len(), 2);
        for arch in &reparsed.arches {
            let image = MachImage::parse(reparsed.slice(&converted, arch).unwrap()).unwrap();
            assert_eq!(image.header.filetype, MH_DYLIB);
            assert_eq!(
                image.find_command(LC_ID_DYLIB).unwrap().dylib_name().unwrap(),
                "@rpath/libtool.dylib"
            );
        }
    }

    #[test]
    fn test_dylibify_fat_rejects_non_64bit_member() {
        // MH_MAGIC (32-bit) slice inside the container
        let container = fat::assemble(&[FatMember {
            arch: FatArch {
                cputype: 12,
                cpusubtype: 9,
                offset: 0,
                size: 0,
                align: 14,
            },
            data: vec![0xCE, 0xFA, 0xED, 0xFE, 0, 0, 0, 0],
        }]);

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tool");
        fs::write(&input, &container).unwrap();

        assert!(matches!(
            dylibify(&input, dir.path().join("out.dylib")),
            Err(Error::FatMemberUnsupported { cputype: 12 })
        ));
    }

    #[test]
    fn test_dylibify_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            dylibify(dir.path().join("absent"), dir.path().join("out.dylib")),
            Err(Error::FileOpen { .. })
        ));
    }
}
