//! Dependency selection and removal.
//!
//! Removal candidates come from two sources: names the caller lists
//! explicitly, and (when auto-removal is on) declared dependencies the host
//! loader cannot open. Before anything is removed, the symbol tables and
//! bind streams are walked against the pre-mutation ordinal snapshot to
//! find the symbols a removal would orphan; the caller uses that set to
//! decide whether a stub dependency is required.

use std::collections::BTreeSet;

use tracing::debug;

use super::ordinal::OrdinalTable;
use crate::error::{Error, Result};
use crate::macho::bind::{self, BindStreamKind};
use crate::macho::{
    MachImage, DYNAMIC_LOOKUP_ORDINAL, EXECUTABLE_ORDINAL, SELF_LIBRARY_ORDINAL,
};

/// Returns true when the host dynamic loader can open the dependency.
///
/// This probes the build host's resolver, not the deployment target;
/// auto-removal treats the answer as best-effort.
pub fn host_resolvable(name: &str) -> bool {
    // Safety: the handle is dropped before this returns and no symbols are
    // resolved through it, so only dlopen's own initializer hazards apply.
    let probe = unsafe { libloading::Library::new(name) };
    probe.is_ok()
}

/// Decides which declared dependencies to remove.
///
/// Explicit names must exist in the pre-mutation table; an unknown name is
/// [`Error::DependencyNotFound`] before anything has been touched. With
/// `auto_remove`, every remaining dependency is probed and the unresolvable
/// ones join the set.
pub fn select_removals(
    table: &OrdinalTable,
    explicit: &[String],
    auto_remove: bool,
) -> Result<BTreeSet<String>> {
    let mut removals = BTreeSet::new();

    for name in explicit {
        if table.ordinal_of(name).is_none() {
            return Err(Error::dependency_not_found(name.clone()));
        }
        removals.insert(name.clone());
    }

    if auto_remove {
        for name in table.names() {
            if removals.contains(name) {
                continue;
            }
            if !host_resolvable(name) {
                debug!("{} does not resolve on this host, removing", name);
                removals.insert(name.clone());
            }
        }
    }

    Ok(removals)
}

/// Collects the symbols that still bind to a removed dependency.
///
/// Walks both encodings against the pre-mutation table: the three dyld bind
/// streams and the undefined external symbol table entries. Sentinel and
/// special ordinals reference no dependency and are skipped; a positive
/// ordinal beyond the table is [`Error::OrdinalOutOfRange`].
pub fn collect_orphans(
    image: &MachImage,
    before: &OrdinalTable,
    removed: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    let mut orphans = BTreeSet::new();

    if let Some(info) = image.dyld_info() {
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
            for binding in scan.bindings {
                if binding.ordinal <= 0 {
                    continue;
                }
                if binding.ordinal > before.len() as i64 {
                    return Err(Error::OrdinalOutOfRange {
                        ordinal: binding.ordinal,
                    });
                }
                if let Some(name) = before.name_of(binding.ordinal as u32) {
                    if removed.contains(name) {
                        orphans.insert(binding.name);
                    }
                }
            }
        }
    }

    if let Some(symtab) = image.symtab() {
        for index in 0..symtab.nsyms as usize {
            let sym = image.nlist(&symtab, index)?;
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
            if ordinal as usize > before.len() {
                return Err(Error::OrdinalOutOfRange {
                    ordinal: ordinal as i64,
                });
            }
            if let Some(name) = before.name_of(ordinal as u32) {
                if removed.contains(name) {
                    orphans.insert(image.symbol_name(&symtab, &sym)?);
                }
            }
        }
    }

    Ok(orphans)
}

/// Drops the load commands of the removed dependencies, returning how many
/// were dropped.
pub fn remove_dependencies(image: &mut MachImage, removed: &BTreeSet<String>) -> usize {
    let mut count = 0;
    image.commands_mut().retain(|record| {
        let gone = record.is_dependency()
            && record
                .dylib_name()
                .is_some_and(|name| removed.contains(&name));
        if gone {
            count += 1;
        }
        !gone
    });
    count
}
