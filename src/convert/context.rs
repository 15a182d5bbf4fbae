//! Per-slice conversion state.

use tracing::{info, warn};

use super::ordinal::OrdinalTable;
use crate::error::Result;
use crate::macho::MachImage;

/// State carried through the conversion of one Mach-O slice.
///
/// The dependency table is snapshotted at construction, strictly before any
/// command is added or removed; every later ordinal decision is made against
/// this snapshot rather than the mutated image.
#[derive(Debug)]
pub struct ConversionContext {
    /// The image being converted
    pub image: MachImage,
    /// Dependency names in declaration order, as the input declared them
    pub before: OrdinalTable,
    /// Architecture name for log prefixes
    pub arch: &'static str,
    /// Verbosity level (0 = errors only)
    pub verbosity: u8,
}

impl ConversionContext {
    /// Creates a context for the slice, snapshotting its dependency table.
    pub fn new(image: MachImage) -> Result<Self> {
        let arch = image.arch_name()?;
        let before = OrdinalTable::scan(&image)?;
        Ok(Self {
            image,
            before,
            arch,
            verbosity: 1,
        })
    }

    /// Sets the verbosity level.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Logs a warning, prefixed with the slice architecture.
    pub fn warn(&self, message: &str) {
        if self.verbosity >= 1 {
            warn!("{}: {}", self.arch, message);
        }
    }

    /// Logs an informational message, prefixed with the slice architecture.
    pub fn info(&self, message: &str) {
        if self.verbosity >= 2 {
            info!("{}: {}", self.arch, message);
        }
    }
}
