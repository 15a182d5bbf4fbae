//! Dependency-ordinal remapping.
//!
//! Removing or inserting dylib load commands renumbers every dependency that
//! follows: library ordinals are nothing but 1-based declaration positions.
//! This module recovers referential integrity after the dependency set has
//! been mutated. The table of the original image is snapshotted before any
//! mutation, the table of the mutated image is recomputed from a fresh scan,
//! and an [`OrdinalMap`] between the two drives an in-place rewrite of every
//! stored ordinal in both symbol encodings:
//!
//! - modern: `BIND_OPCODE_SET_DYLIB_ORDINAL_{IMM,ULEB}` slots in the bind,
//!   weak-bind, and lazy-bind opcode streams;
//! - legacy: the high byte of `n_desc` in undefined external `nlist_64`
//!   entries.
//!
//! Special and sentinel ordinals (self, main-executable, flat-lookup,
//! weak-lookup, dynamic-lookup) name no dependency and pass through
//! untouched.

use tracing::debug;

use crate::error::{Error, Result};
use crate::macho::bind::{self, BindStreamKind};
use crate::macho::{
    MachImage, DYNAMIC_LOOKUP_ORDINAL, EXECUTABLE_ORDINAL, SELF_LIBRARY_ORDINAL,
};

// =============================================================================
// Ordinal Table
// =============================================================================

/// The dependency table of one image state: name per 1-based ordinal, in
/// load-command declaration order. `LC_ID_DYLIB` never takes part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdinalTable {
    names: Vec<String>,
}

impl OrdinalTable {
    /// Scans the image's load commands in declaration order.
    ///
    /// Duplicate dependency names are rejected: the name-keyed remapping
    /// between two table states would be ill-defined.
    pub fn scan(image: &MachImage) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for record in image.commands() {
            if !record.is_dependency() {
                continue;
            }
            let name = record
                .dylib_name()
                .ok_or_else(|| Error::buffer_too_small(record.cmdsize() + 1, record.cmdsize()))?;
            if names.contains(&name) {
                return Err(Error::DuplicateDependency { name });
            }
            names.push(name);
        }
        Ok(Self { names })
    }

    /// Number of dependencies in the table.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if the image declares no dependencies.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Returns the 1-based ordinal of a dependency name.
    pub fn ordinal_of(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| (i + 1) as u32)
    }

    /// Returns the dependency name declared at a 1-based ordinal.
    pub fn name_of(&self, ordinal: u32) -> Option<&str> {
        if ordinal == 0 {
            return None;
        }
        self.names.get(ordinal as usize - 1).map(String::as_str)
    }

    /// The dependency names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

// =============================================================================
// Ordinal Map
// =============================================================================

#[derive(Debug, Clone)]
enum Slot {
    /// The dependency survives (or redirects to the stub) at this ordinal.
    Mapped(u32),
    /// The dependency was removed and no stub exists to absorb it.
    Removed(String),
}

/// Maps each pre-mutation ordinal to its post-mutation value.
#[derive(Debug, Clone)]
pub struct OrdinalMap {
    slots: Vec<Slot>,
}

impl OrdinalMap {
    /// Builds the map between two table states.
    ///
    /// Names present in both tables map position to position; names missing
    /// from `after` redirect to `stub_ordinal` when one exists.
    pub fn build(before: &OrdinalTable, after: &OrdinalTable, stub_ordinal: Option<u32>) -> Self {
        let slots = before
            .names()
            .iter()
            .map(|name| match (after.ordinal_of(name), stub_ordinal) {
                (Some(new), _) => Slot::Mapped(new),
                (None, Some(stub)) => Slot::Mapped(stub),
                (None, None) => Slot::Removed(name.clone()),
            })
            .collect();
        Self { slots }
    }

    /// Resolves one stored ordinal.
    ///
    /// Non-positive values are the modern special ordinals and pass through
    /// unchanged. A positive ordinal outside the original table is
    /// [`Error::OrdinalOutOfRange`]; one that names a removed dependency
    /// with no stub to absorb it is [`Error::StubRequiredButMissing`].
    pub fn lookup(&self, ordinal: i64) -> Result<i64> {
        if ordinal <= 0 {
            return Ok(ordinal);
        }
        match self.slots.get(ordinal as usize - 1) {
            Some(Slot::Mapped(new)) => Ok(*new as i64),
            Some(Slot::Removed(name)) => Err(Error::StubRequiredButMissing { name: name.clone() }),
            None => Err(Error::OrdinalOutOfRange { ordinal }),
        }
    }
}

// =============================================================================
// Stream Rewriting
// =============================================================================

/// Rewrites the ordinal slots of all three dyld bind streams in place.
///
/// Returns the number of slots whose value actually changed. Streams are
/// never re-laid-out: stub-helper code addresses lazy-bind entries by their
/// stream offsets, so each slot keeps its exact length (padded ULEB
/// continuation bytes make up any difference).
pub fn rewrite_modern(image: &mut MachImage, map: &OrdinalMap) -> Result<usize> {
    let Some(info) = image.dyld_info() else {
        return Ok(0);
    };

    let mut patched = 0;
    let streams = [
        (BindStreamKind::Bind, info.bind_off, info.bind_size),
        (BindStreamKind::WeakBind, info.weak_bind_off, info.weak_bind_size),
        (BindStreamKind::LazyBind, info.lazy_bind_off, info.lazy_bind_size),
    ];

    for (kind, offset, size) in streams {
        if size == 0 {
            continue;
        }
        let scan = bind::scan_stream(image.read_at(offset as usize, size as usize)?, kind)?;
        let region = image.region_mut(offset as usize, size as usize)?;
        for site in &scan.sites {
            if site.is_special() {
                continue;
            }
            let new = map.lookup(site.ordinal)?;
            if new != site.ordinal {
                bind::patch_ordinal(region, site, new as u32)?;
                patched += 1;
            }
        }
        debug!("{:?}: {} ordinal sites", kind, scan.sites.len());
    }

    Ok(patched)
}

/// Rewrites the library ordinal of every undefined external symbol table
/// entry, returning the number of entries that changed.
///
/// Defined symbols and stabs carry no dependency reference; the legacy
/// sentinel ordinals (self, dynamic-lookup, main-executable) pass through.
pub fn rewrite_legacy(image: &mut MachImage, map: &OrdinalMap) -> Result<usize> {
    let Some(symtab) = image.symtab() else {
        return Ok(0);
    };

    let mut rewritten = 0;
    for index in 0..symtab.nsyms as usize {
        let mut sym = image.nlist(&symtab, index)?;
        if sym.is_debug() || !sym.is_undefined() || !sym.is_external() {
            continue;
        }
        let ordinal = sym.library_ordinal();
        if matches!(
            ordinal,
            SELF_LIBRARY_ORDINAL | DYNAMIC_LOOKUP_ORDINAL | EXECUTABLE_ORDINAL
        ) {
            continue;
        }
        let new = map.lookup(ordinal as i64)?;
        if new != ordinal as i64 {
            sym.set_library_ordinal(new as u8);
            image.set_nlist(&symtab, index, &sym)?;
            rewritten += 1;
        }
    }

    Ok(rewritten)
}
