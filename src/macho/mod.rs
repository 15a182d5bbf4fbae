//! Mach-O file format handling.
//!
//! This module provides types and utilities for parsing and modifying Mach-O
//! files, which are the executable format used on macOS and iOS. `image`
//! models a single 64-bit slice, `fat` handles universal containers, and
//! `bind` interprets the dyld bind opcode streams.

pub mod bind;
mod constants;
pub mod fat;
mod image;
mod structs;

#[cfg(test)]
pub(crate) mod testutil;

pub use constants::*;
pub use image::*;
pub use structs::*;
