//! Error types for the executable-to-dylib converter.
//!
//! This module provides error handling for every conversion stage: Mach-O
//! parsing, dependency pruning, ordinal remapping, stub synthesis, and the
//! external toolchain invocations.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for dylibify operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Mach-O Format Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMagic(u32),

    #[error("not an executable image (file type {filetype:#x}); only MH_EXECUTE inputs can be converted")]
    NotAnExecutable { filetype: u32 },

    #[error("fat member for cputype {cputype:#x} is not a 64-bit Mach-O; only 64-bit slices are supported")]
    FatMemberUnsupported { cputype: u32 },

    #[error("unknown CPU type {cputype:#x} (subtype {cpusubtype:#x})")]
    UnknownCpuType { cputype: u32, cpusubtype: u32 },

    #[error("image uses LC_DYLD_CHAINED_FIXUPS; chained-fixup binding is not supported")]
    ChainedFixupsUnsupported,

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("insufficient space for new load commands (need {needed} bytes, have {available})")]
    InsufficientLoadCommandSpace { needed: usize, available: usize },

    #[error("Mach-O section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    #[error("unknown bind opcode {opcode:#x} at offset {offset:#x}")]
    UnknownBindOpcode { opcode: u8, offset: usize },

    // ==================== Dependency Errors ====================
    #[error("dependency not found: '{name}' is not declared by the input image")]
    DependencyNotFound { name: String },

    #[error("duplicate dependency declaration: '{name}'")]
    DuplicateDependency { name: String },

    // ==================== Ordinal Remapping Errors ====================
    #[error("library ordinal {ordinal} is outside the image's dependency table")]
    OrdinalOutOfRange { ordinal: i64 },

    #[error("dependency '{name}' was removed but symbols still bind to it and no stub exists")]
    StubRequiredButMissing { name: String },

    #[error("ordinal {ordinal} does not fit the bind-stream slot at offset {offset:#x}")]
    BindOrdinalOverflow { ordinal: u32, offset: usize },

    // ==================== Stub Synthesis Errors ====================
    #[error("symbol '{name}' is neither a class nor a C-function reference; cannot synthesize a stub")]
    UnclassifiableSymbol { name: String },

    // ==================== Toolchain Errors ====================
    #[error("failed to spawn '{tool}': {source}")]
    ToolchainSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{tool}' failed with {status}: {stderr}")]
    ToolchainFailure {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("'{tool}' did not finish within {secs} seconds")]
    ToolchainTimeout { tool: String, secs: u64 },
}

/// A specialized Result type for dylibify operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error came from the input image rather than from
    /// the conversion request or the host toolchain.
    #[inline]
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidMagic(..)
                | Error::NotAnExecutable { .. }
                | Error::FatMemberUnsupported { .. }
                | Error::UnknownCpuType { .. }
                | Error::ChainedFixupsUnsupported
                | Error::LoadCommandOverflow { .. }
                | Error::BufferTooSmall { .. }
                | Error::InvalidUleb128 { .. }
                | Error::UnknownBindOpcode { .. }
                | Error::DuplicateDependency { .. }
                | Error::OrdinalOutOfRange { .. }
        )
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }

    /// Creates a dependency not found error.
    #[inline]
    pub fn dependency_not_found(name: impl Into<String>) -> Self {
        Error::DependencyNotFound { name: name.into() }
    }

    /// Creates a toolchain failure from a finished process.
    #[inline]
    pub fn toolchain_failure(
        tool: impl Into<String>,
        status: impl ToString,
        stderr: impl Into<String>,
    ) -> Self {
        Error::ToolchainFailure {
            tool: tool.into(),
            status: status.to_string(),
            stderr: stderr.into(),
        }
    }
}
