//! Header and load-command transforms that turn an executable into a dylib.
//!
//! Each step here is structural only: commands come and go and the header
//! changes, but dependency ordinals are untouched. Ordinal repair happens
//! afterwards, once the final command list is known.

use crate::error::{Error, Result};
use crate::macho::{
    make_build_version_command, make_dylib_command, LinkeditDataCommand, MachImage, MachOFlags,
    LC_BUILD_VERSION, LC_CODE_SIGNATURE, LC_ID_DYLIB, LC_LOAD_DYLINKER, LC_MAIN,
    LC_SOURCE_VERSION, LC_VERSION_MIN_IPHONEOS, LC_VERSION_MIN_MACOSX, LC_VERSION_MIN_TVOS,
    LC_VERSION_MIN_WATCHOS, MH_DYLIB,
};
use crate::TargetPlatform;

/// Deployment version declared when retargeting, 11.0.0 for both platforms.
const RETARGET_VERSION: (u16, u8, u8) = (11, 0, 0);

/// Rewrites the header from executable to dylib.
///
/// Dyld refuses to search a dylib for re-exported symbols unless the image
/// was linked with sub-libraries, so `MH_NO_REEXPORTED_DYLIBS` is set to
/// spare it the scan.
pub fn rewrite_filetype(image: &mut MachImage) -> Result<()> {
    if !image.header.is_executable() {
        return Err(Error::NotAnExecutable {
            filetype: image.header.filetype,
        });
    }
    image.header.filetype = MH_DYLIB;
    image.header.flags |= MachOFlags::NO_REEXPORTED_DYLIBS.bits();
    Ok(())
}

/// Drops the code signature, returning whether one was present.
///
/// The signature covers every byte before it, so any edit here invalidates
/// it anyway. When the blob sits at the tail of the slice (the linker always
/// puts it there) the bytes are cut off and `__LINKEDIT` shrinks to match;
/// otherwise only the command is dropped and the blob stays as dead space.
pub fn strip_code_signature(image: &mut MachImage) -> Result<bool> {
    let Some(record) = image.find_command(LC_CODE_SIGNATURE) else {
        return Ok(false);
    };
    let sig: LinkeditDataCommand = record.read()?;

    let blob_end = sig.dataoff as usize + sig.datasize as usize;
    if sig.datasize > 0 && blob_end == image.len() {
        image.truncate(sig.dataoff as usize);
        if let Some((index, mut seg)) = image.segment("__LINKEDIT") {
            seg.filesize = seg.filesize.saturating_sub(sig.datasize as u64);
            image.update_segment(index, &seg)?;
        }
    }

    image.commands_mut().retain(|c| c.cmd != LC_CODE_SIGNATURE);
    Ok(true)
}

/// Drops the `__PAGEZERO` segment command, returning whether it was present.
///
/// Dylibs load at a slide chosen by dyld; a reservation at address zero is
/// meaningless for them and macOS dyld rejects dylibs that carry one.
pub fn remove_pagezero(image: &mut MachImage) -> bool {
    let Some((index, _)) = image.segment("__PAGEZERO") else {
        return false;
    };
    image.commands_mut().remove(index);
    true
}

/// Appends the LC_ID_DYLIB command declaring the install name.
pub fn add_identity(image: &mut MachImage, path: &str) {
    image
        .commands_mut()
        .push(make_dylib_command(LC_ID_DYLIB, path, 2, 0x0001_0000, 0x0001_0000));
}

/// Zeroes and unregisters the embedded `__TEXT,__info_plist` section.
///
/// Returns false when the image has no such section.
pub fn remove_info_plist(image: &mut MachImage) -> Result<bool> {
    match image.remove_section("__TEXT", "__info_plist", true) {
        Ok(()) => Ok(true),
        Err(Error::SectionNotFound { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Drops the load commands that only make sense for a main executable,
/// returning how many were dropped.
///
/// LC_MAIN names the entry point and LC_LOAD_DYLINKER requests dyld itself;
/// a library has neither. LC_SOURCE_VERSION goes with them since it
/// describes the original executable's sources, not the derived dylib.
pub fn remove_executable_commands(image: &mut MachImage) -> usize {
    let before = image.commands().len();
    image
        .commands_mut()
        .retain(|c| !matches!(c.cmd, LC_LOAD_DYLINKER | LC_MAIN | LC_SOURCE_VERSION));
    before - image.commands().len()
}

/// Replaces every platform declaration with a single LC_BUILD_VERSION for
/// the requested platform.
///
/// All four legacy LC_VERSION_MIN_* variants and any existing
/// LC_BUILD_VERSION are dropped first; the loader tolerates at most one
/// platform claim per slice.
pub fn retarget_platform(image: &mut MachImage, platform: TargetPlatform) {
    image.commands_mut().retain(|c| {
        !matches!(
            c.cmd,
            LC_VERSION_MIN_MACOSX
                | LC_VERSION_MIN_IPHONEOS
                | LC_VERSION_MIN_TVOS
                | LC_VERSION_MIN_WATCHOS
                | LC_BUILD_VERSION
        )
    });

    let (major, minor, patch) = RETARGET_VERSION;
    let version = crate::macho::pack_version(major, minor, patch);
    image
        .commands_mut()
        .push(make_build_version_command(platform.platform_id(), version, version));
}
