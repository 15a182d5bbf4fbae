//! Conversion of a Mach-O executable slice into a dylib.
//!
//! The conversion edits one thin slice in memory. Every step that could
//! fail is validated before the image is serialized, so a conversion either
//! completes or leaves no output at all.
//!
//! # Conversion Pipeline
//!
//! The slice pipeline runs in this order:
//!
//! 1. **Snapshot** - The dependency table is captured before any edit
//! 2. **Header Rewrite** - Filetype, flags, code signature, `__PAGEZERO`,
//!    identity, and executable-only load commands
//! 3. **Pruning** - Explicitly named and host-unresolvable dependencies are
//!    dropped, and the symbols they orphan are collected
//! 4. **Stub Declaration** - When symbols were orphaned, a synthetic stub
//!    dependency is appended after the survivors to adopt them
//! 5. **Ordinal Repair** - Bind streams and symbol table entries are
//!    rewritten against the snapshot so every reference still lands on the
//!    dependency it originally named

mod context;
mod fuse;
mod header;
mod ordinal;
mod prune;
mod stub;
mod toolchain;

pub use context::*;
pub use fuse::*;
pub use header::*;
pub use ordinal::*;
pub use prune::*;
pub use stub::*;
pub use toolchain::*;

use crate::error::{Error, Result};
use crate::macho::{make_dylib_command, MachImage, LC_LOAD_DYLIB};
use crate::DylibifyOptions;

/// The result of converting one slice.
#[derive(Debug)]
pub struct SliceOutcome {
    /// The converted image, rebuilt and ordinal-repaired
    pub image: MachImage,
    /// Stub compilation request, present when symbols were orphaned
    pub stub: Option<StubRequest>,
}

/// Converts one executable slice into a dylib with the given install name.
///
/// The returned image is fully serialized; when dependencies were removed
/// and symbols orphaned, the outcome also carries the source of the stub
/// dylib that must be compiled next to the output.
pub fn convert_slice(
    image: MachImage,
    identity: &str,
    options: &DylibifyOptions,
) -> Result<SliceOutcome> {
    if image.has_chained_fixups() {
        return Err(Error::ChainedFixupsUnsupported);
    }

    let mut ctx = ConversionContext::new(image)?.with_verbosity(options.verbosity);

    // Unknown explicit names fail here, before the image is touched.
    let removals = select_removals(
        &ctx.before,
        &options.remove_dylibs,
        options.auto_remove_dylibs,
    )?;

    rewrite_filetype(&mut ctx.image)?;
    if strip_code_signature(&mut ctx.image)? {
        ctx.info("stripped code signature");
    }
    if remove_pagezero(&mut ctx.image) {
        ctx.info("removed __PAGEZERO");
    }
    add_identity(&mut ctx.image, identity);
    ctx.info(&format!("declared identity {identity}"));

    if options.remove_info_plist {
        if remove_info_plist(&mut ctx.image)? {
            ctx.info("removed __TEXT,__info_plist");
        } else {
            ctx.warn("no __TEXT,__info_plist section to remove");
        }
    }

    let dropped = remove_executable_commands(&mut ctx.image);
    if dropped > 0 {
        ctx.info(&format!("removed {dropped} executable-only load commands"));
    }

    if let Some(platform) = options.platform {
        retarget_platform(&mut ctx.image, platform);
        ctx.info(&format!("declared platform {platform}"));
    }

    // Orphans are collected from the untouched bind streams and symbol
    // table, against the pre-mutation snapshot.
    let orphans = collect_orphans(&ctx.image, &ctx.before, &removals)?;
    for name in &removals {
        ctx.info(&format!("removing dependency {name}"));
    }
    remove_dependencies(&mut ctx.image, &removals);

    let stub = if orphans.is_empty() {
        None
    } else {
        let (classes, functions) = classify_orphans(&orphans)?;
        let install_name = stub_install_name(identity);
        ctx.image.commands_mut().push(make_dylib_command(
            LC_LOAD_DYLIB,
            &install_name,
            2,
            0x0001_0000,
            0x0001_0000,
        ));
        ctx.info(&format!(
            "{} orphaned symbols adopted by {install_name}",
            orphans.len()
        ));
        Some(StubRequest {
            arch: ctx.arch,
            source: render_stub_source(&classes, &functions),
        })
    };

    ctx.image.rebuild()?;

    // The stub was pushed after every surviving dependency, so its ordinal
    // is the end of the rebuilt table.
    let after = OrdinalTable::scan(&ctx.image)?;
    let stub_ordinal = stub.is_some().then(|| after.len() as u32);
    let map = OrdinalMap::build(&ctx.before, &after, stub_ordinal);

    let patched = rewrite_modern(&mut ctx.image, &map)?;
    let rewritten = rewrite_legacy(&mut ctx.image, &map)?;
    if patched + rewritten > 0 {
        ctx.info(&format!(
            "remapped {patched} bind sites and {rewritten} symbol entries"
        ));
    }

    Ok(SliceOutcome {
        image: ctx.image,
        stub,
    })
}
