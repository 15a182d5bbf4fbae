//! Bind opcode stream scanning and in-place rewriting.
//!
//! `LC_DYLD_INFO` encodes symbol binding as three opcode streams (bind, weak
//! bind, lazy bind). Each stream is a little interpreter program: state-setting
//! opcodes pick the dylib ordinal, symbol name, segment and offset, and
//! DO_BIND-style opcodes emit a binding with the current state.
//!
//! Two views of a stream matter here:
//! - the symbols it binds and the ordinal each one resolves through, and
//! - the byte positions of the ordinal-setting instructions, so ordinals can
//!   be rewritten without moving any other byte. Lazy-bind entry offsets are
//!   referenced from stub-helper code, so streams are never re-laid-out; a
//!   ULEB slot is rewritten with padded continuation bytes to keep its length.

use crate::error::{Error, Result};
use crate::macho::constants::*;
use crate::util;

// =============================================================================
// Scan Model
// =============================================================================

/// Which of the three dyld-info streams is being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStreamKind {
    /// Non-lazy bindings, applied at load time
    Bind,
    /// Weak bindings, coalesced across images
    WeakBind,
    /// Lazy bindings, applied on first call through a stub
    LazyBind,
}

/// Encoding of one ordinal-setting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdinalEncoding {
    /// `SET_DYLIB_ORDINAL_IMM`: ordinal in the opcode's low nibble
    Immediate,
    /// `SET_DYLIB_ORDINAL_ULEB`: ULEB payload of `len` bytes after the opcode
    Uleb { len: usize },
    /// `SET_DYLIB_SPECIAL_IMM`: sign-extended sentinel, never rewritten
    Special,
}

/// An ordinal-setting instruction located inside a stream.
#[derive(Debug, Clone)]
pub struct OrdinalSite {
    /// Byte offset of the opcode within the stream
    pub offset: usize,
    /// How the ordinal is encoded
    pub encoding: OrdinalEncoding,
    /// The ordinal the instruction sets (<= 0 for sentinels)
    pub ordinal: i64,
}

impl OrdinalSite {
    /// Returns true if this site carries a sentinel ordinal.
    #[inline]
    pub fn is_special(&self) -> bool {
        self.ordinal <= BIND_SPECIAL_DYLIB_SELF
    }
}

/// A symbol observed at a DO_BIND-style opcode, with the ordinal in effect.
#[derive(Debug, Clone)]
pub struct SymbolBinding {
    /// Symbol name, including the leading underscore
    pub name: String,
    /// Library ordinal the symbol resolves through (<= 0 for sentinels)
    pub ordinal: i64,
}

/// Everything a single pass over one stream produces.
#[derive(Debug, Default)]
pub struct BindScan {
    /// Ordinal-setting instructions, in stream order
    pub sites: Vec<OrdinalSite>,
    /// Symbols bound by the stream
    pub bindings: Vec<SymbolBinding>,
}

// =============================================================================
// Scanning
// =============================================================================

#[inline]
fn uleb_at(data: &[u8], pos: usize) -> Result<(u64, usize)> {
    util::read_uleb128(&data[pos..]).ok_or(Error::InvalidUleb128 { offset: pos })
}

#[inline]
fn sleb_at(data: &[u8], pos: usize) -> Result<(i64, usize)> {
    util::read_sleb128(&data[pos..]).ok_or(Error::InvalidUleb128 { offset: pos })
}

/// Scans one bind stream, collecting ordinal sites and symbol bindings.
///
/// `DONE` terminates the bind and weak-bind streams; in the lazy stream it
/// separates entries and scanning continues to the end of the region.
pub fn scan_stream(data: &[u8], kind: BindStreamKind) -> Result<BindScan> {
    let mut scan = BindScan::default();
    let mut pos = 0usize;
    let mut ordinal: i64 = BIND_SPECIAL_DYLIB_SELF;
    let mut symbol = String::new();

    while pos < data.len() {
        let byte = data[pos];
        let opcode = byte & BIND_OPCODE_MASK;
        let imm = byte & BIND_IMMEDIATE_MASK;
        let opcode_offset = pos;
        pos += 1;

        match opcode {
            BIND_OPCODE_DONE => {
                if kind != BindStreamKind::LazyBind {
                    break;
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                ordinal = imm as i64;
                scan.sites.push(OrdinalSite {
                    offset: opcode_offset,
                    encoding: OrdinalEncoding::Immediate,
                    ordinal,
                });
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let (value, len) = uleb_at(data, pos)?;
                ordinal = value as i64;
                scan.sites.push(OrdinalSite {
                    offset: opcode_offset,
                    encoding: OrdinalEncoding::Uleb { len },
                    ordinal,
                });
                pos += len;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // Sign-extend the low nibble: 0x0 -> SELF, 0xF -> -1, ...
                ordinal = if imm == 0 {
                    BIND_SPECIAL_DYLIB_SELF
                } else {
                    (imm as i64) | !(BIND_IMMEDIATE_MASK as i64)
                };
                scan.sites.push(OrdinalSite {
                    offset: opcode_offset,
                    encoding: OrdinalEncoding::Special,
                    ordinal,
                });
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let end = pos + util::memchr_null(&data[pos..]);
                if end >= data.len() {
                    return Err(Error::buffer_too_small(end + 1, data.len()));
                }
                symbol = String::from_utf8_lossy(&data[pos..end]).into_owned();
                pos = end + 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB => {
                let (_, len) = sleb_at(data, pos)?;
                pos += len;
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | BIND_OPCODE_ADD_ADDR_ULEB => {
                let (_, len) = uleb_at(data, pos)?;
                pos += len;
            }
            BIND_OPCODE_DO_BIND | BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                scan.bindings.push(SymbolBinding {
                    name: symbol.clone(),
                    ordinal,
                });
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                scan.bindings.push(SymbolBinding {
                    name: symbol.clone(),
                    ordinal,
                });
                let (_, len) = uleb_at(data, pos)?;
                pos += len;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                // Binds the same symbol at a run of addresses; one record
                scan.bindings.push(SymbolBinding {
                    name: symbol.clone(),
                    ordinal,
                });
                let (_, len) = uleb_at(data, pos)?;
                pos += len;
                let (_, len) = uleb_at(data, pos)?;
                pos += len;
            }
            BIND_OPCODE_THREADED => match imm {
                BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB => {
                    let (_, len) = uleb_at(data, pos)?;
                    pos += len;
                }
                BIND_SUBOPCODE_THREADED_APPLY => {}
                _ => {
                    return Err(Error::UnknownBindOpcode {
                        opcode: byte,
                        offset: opcode_offset,
                    })
                }
            },
            _ => {
                return Err(Error::UnknownBindOpcode {
                    opcode: byte,
                    offset: opcode_offset,
                })
            }
        }
    }

    Ok(scan)
}

// =============================================================================
// Patching
// =============================================================================

/// Rewrites one ordinal site in place.
///
/// The slot keeps its exact byte length: IMM slots take ordinals up to 15,
/// ULEB slots any ordinal whose minimal encoding fits (shorter values are
/// padded with redundant continuation bytes). Sites with sentinel encodings
/// are left untouched.
pub fn patch_ordinal(data: &mut [u8], site: &OrdinalSite, new_ordinal: u32) -> Result<()> {
    match site.encoding {
        OrdinalEncoding::Immediate => {
            if new_ordinal > BIND_IMMEDIATE_MASK as u32 {
                return Err(Error::BindOrdinalOverflow {
                    ordinal: new_ordinal,
                    offset: site.offset,
                });
            }
            data[site.offset] = BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | (new_ordinal as u8);
            Ok(())
        }
        OrdinalEncoding::Uleb { len } => {
            let start = site.offset + 1;
            if !util::write_uleb128_padded(&mut data[start..start + len], new_ordinal as u64) {
                return Err(Error::BindOrdinalOverflow {
                    ordinal: new_ordinal,
                    offset: site.offset,
                });
            }
            Ok(())
        }
        // Sentinel slots carry no table ordinal and are never rewritten
        OrdinalEncoding::Special => Ok(()),
    }
}
