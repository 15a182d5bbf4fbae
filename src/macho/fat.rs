//! Fat (universal) container handling.
//!
//! A fat file is a big-endian header plus a table of per-architecture
//! members, each pointing at a complete thin Mach-O slice. Conversion works
//! on the thin slices; this module splits a container into its members and
//! reassembles one with the members' original alignment.

use byteorder::{BigEndian, ByteOrder};

use super::constants::{FAT_MAGIC, FAT_MAGIC_64};
use crate::error::{Error, Result};
use crate::util::align_up;

/// Size of the fat header (magic + member count).
const FAT_HEADER_SIZE: usize = 8;

/// Size of one fat arch table entry.
const FAT_ARCH_SIZE: usize = 20;

// =============================================================================
// Fat Arch
// =============================================================================

/// One member of a fat container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File offset of the member slice
    pub offset: u32,
    /// Size of the member slice in bytes
    pub size: u32,
    /// Alignment of the member as a power of two
    pub align: u32,
}

/// A member slice paired with the bytes that should land in the rebuilt
/// container.
#[derive(Debug, Clone)]
pub struct FatMember {
    /// Layout template carried over from the input container
    pub arch: FatArch,
    /// The member's slice bytes
    pub data: Vec<u8>,
}

// =============================================================================
// Fat File
// =============================================================================

/// Parsed fat container table.
#[derive(Debug)]
pub struct FatFile {
    /// Member table in declaration order
    pub arches: Vec<FatArch>,
}

/// Returns true when the buffer starts with a fat container magic.
pub fn is_fat(data: &[u8]) -> bool {
    data.len() >= 4 && {
        let magic = BigEndian::read_u32(data);
        magic == FAT_MAGIC || magic == FAT_MAGIC_64
    }
}

impl FatFile {
    /// Parses the fat header and member table.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FAT_HEADER_SIZE {
            return Err(Error::buffer_too_small(FAT_HEADER_SIZE, data.len()));
        }

        let magic = BigEndian::read_u32(data);
        if magic != FAT_MAGIC {
            // fat64 containers exist but never occur for user binaries
            return Err(Error::InvalidMagic(magic));
        }

        let count = BigEndian::read_u32(&data[4..]) as usize;
        let table_end = FAT_HEADER_SIZE + count * FAT_ARCH_SIZE;
        if data.len() < table_end {
            return Err(Error::buffer_too_small(table_end, data.len()));
        }

        let mut arches = Vec::with_capacity(count);
        for i in 0..count {
            let entry = &data[FAT_HEADER_SIZE + i * FAT_ARCH_SIZE..];
            let arch = FatArch {
                cputype: BigEndian::read_u32(entry),
                cpusubtype: BigEndian::read_u32(&entry[4..]),
                offset: BigEndian::read_u32(&entry[8..]),
                size: BigEndian::read_u32(&entry[12..]),
                align: BigEndian::read_u32(&entry[16..]),
            };
            let end = arch.offset as usize + arch.size as usize;
            if end > data.len() {
                return Err(Error::buffer_too_small(end, data.len()));
            }
            arches.push(arch);
        }

        Ok(Self { arches })
    }

    /// Borrows one member's slice bytes out of the container.
    pub fn slice<'a>(&self, data: &'a [u8], arch: &FatArch) -> Result<&'a [u8]> {
        let start = arch.offset as usize;
        let end = start + arch.size as usize;
        if end > data.len() {
            return Err(Error::buffer_too_small(end, data.len()));
        }
        Ok(&data[start..end])
    }
}

/// Builds a fat container from member slices, preserving each member's
/// alignment. Gaps are zero-filled.
pub fn assemble(members: &[FatMember]) -> Vec<u8> {
    let table_end = FAT_HEADER_SIZE + members.len() * FAT_ARCH_SIZE;

    // Lay out the members first so the table can carry final offsets
    let mut offsets = Vec::with_capacity(members.len());
    let mut cursor = table_end as u64;
    for member in members {
        cursor = align_up(cursor, 1u64 << member.arch.align);
        offsets.push(cursor);
        cursor += member.data.len() as u64;
    }

    let mut out = vec![0u8; cursor as usize];
    BigEndian::write_u32(&mut out, FAT_MAGIC);
    BigEndian::write_u32(&mut out[4..], members.len() as u32);

    for (i, (member, &offset)) in members.iter().zip(&offsets).enumerate() {
        let entry = &mut out[FAT_HEADER_SIZE + i * FAT_ARCH_SIZE..];
        BigEndian::write_u32(entry, member.arch.cputype);
        BigEndian::write_u32(&mut entry[4..], member.arch.cpusubtype);
        BigEndian::write_u32(&mut entry[8..], offset as u32);
        BigEndian::write_u32(&mut entry[12..], member.data.len() as u32);
        BigEndian::write_u32(&mut entry[16..], member.arch.align);

        out[offset as usize..offset as usize + member.data.len()]
            .copy_from_slice(&member.data);
    }

    out
}
