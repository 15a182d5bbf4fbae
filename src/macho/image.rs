//! Mach-O image model for reading and structurally editing a single slice.
//!
//! Load commands are parsed into owned records so they can be added, removed,
//! and rewritten freely; `rebuild` serializes the record list back into the
//! command region and refreshes the header counts. Everything outside the
//! command region (section contents, symbol table, bind streams) stays at its
//! original file offset and is edited in place, so no offset-bearing field
//! ever needs relocation.

use std::mem;

use tracing::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util;

// =============================================================================
// Load Command Records
// =============================================================================

/// One load command, held as its complete on-disk bytes.
///
/// Unknown command kinds round-trip bit-identically; typed access goes
/// through [`LoadCommandRecord::read`] and [`LoadCommandRecord::write`].
#[derive(Debug, Clone)]
pub struct LoadCommandRecord {
    /// Command type
    pub cmd: u32,
    /// Full command bytes, including the 8-byte command header
    pub bytes: Vec<u8>,
}

impl LoadCommandRecord {
    /// Wraps raw command bytes.
    pub fn new(cmd: u32, bytes: Vec<u8>) -> Self {
        debug_assert!(bytes.len() >= LoadCommand::SIZE);
        Self { cmd, bytes }
    }

    /// Returns the command size in bytes.
    #[inline]
    pub fn cmdsize(&self) -> usize {
        self.bytes.len()
    }

    /// Reads the command's fixed part as a typed structure.
    pub fn read<T: FromBytes>(&self) -> Result<T> {
        T::read_from_prefix(&self.bytes)
            .map(|(value, _)| value)
            .map_err(|_| Error::buffer_too_small(mem::size_of::<T>(), self.bytes.len()))
    }

    /// Writes a typed structure over the command's fixed part.
    pub fn write<T: IntoBytes + Immutable>(&mut self, value: &T) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > self.bytes.len() {
            return Err(Error::buffer_too_small(bytes.len(), self.bytes.len()));
        }
        self.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads a NUL-terminated string embedded in the command at `offset`.
    pub fn string_at(&self, offset: usize) -> Option<String> {
        if offset >= self.bytes.len() {
            return None;
        }
        let tail = &self.bytes[offset..];
        let end = util::memchr_null(tail);
        Some(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Returns true for any dylib reference command (including LC_ID_DYLIB).
    #[inline]
    pub fn is_dylib(&self) -> bool {
        matches!(
            self.cmd,
            LC_LOAD_DYLIB
                | LC_LOAD_WEAK_DYLIB
                | LC_REEXPORT_DYLIB
                | LC_LAZY_LOAD_DYLIB
                | LC_LOAD_UPWARD_DYLIB
                | LC_ID_DYLIB
        )
    }

    /// Returns true for dylib commands that name a dependency.
    ///
    /// LC_ID_DYLIB declares the image's own identity and never takes part in
    /// ordinal numbering.
    #[inline]
    pub fn is_dependency(&self) -> bool {
        self.is_dylib() && self.cmd != LC_ID_DYLIB
    }

    /// Returns the embedded path of a dylib command.
    pub fn dylib_name(&self) -> Option<String> {
        if !self.is_dylib() {
            return None;
        }
        let dylib: DylibCommand = self.read().ok()?;
        self.string_at(dylib.dylib.name_offset as usize)
    }
}

/// Builds a dylib command record with an embedded, NUL-terminated path.
///
/// The command size is padded to an 8-byte multiple as the loader requires.
pub fn make_dylib_command(
    cmd: u32,
    path: &str,
    timestamp: u32,
    current_version: u32,
    compatibility_version: u32,
) -> LoadCommandRecord {
    let name_offset = DylibCommand::SIZE;
    let cmdsize = util::align_up((name_offset + path.len() + 1) as u64, 8) as usize;

    let command = DylibCommand {
        cmd,
        cmdsize: cmdsize as u32,
        dylib: Dylib {
            name_offset: name_offset as u32,
            timestamp,
            current_version,
            compatibility_version,
        },
    };

    let mut bytes = vec![0u8; cmdsize];
    bytes[..DylibCommand::SIZE].copy_from_slice(command.as_bytes());
    bytes[name_offset..name_offset + path.len()].copy_from_slice(path.as_bytes());
    LoadCommandRecord::new(cmd, bytes)
}

/// Builds a build-version command record.
pub fn make_build_version_command(platform: u32, minos: u32, sdk: u32) -> LoadCommandRecord {
    let command = BuildVersionCommand {
        cmd: LC_BUILD_VERSION,
        cmdsize: BuildVersionCommand::SIZE as u32,
        platform,
        minos,
        sdk,
        ntools: 0,
    };
    LoadCommandRecord::new(LC_BUILD_VERSION, command.as_bytes().to_vec())
}

// =============================================================================
// Mach Image
// =============================================================================

/// A single 64-bit Mach-O slice, parsed for structural editing.
#[derive(Debug)]
pub struct MachImage {
    /// The Mach-O header; written back to the data on rebuild
    pub header: MachHeader64,
    /// Full slice bytes
    data: Vec<u8>,
    /// Parsed load commands, in declaration order
    commands: Vec<LoadCommandRecord>,
}

impl MachImage {
    /// Parses a 64-bit Mach-O slice.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::buffer_too_small(MachHeader64::SIZE, data.len()));
        }

        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::InvalidMagic(0))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMagic(header.magic));
        }

        let mut image = Self {
            header,
            data: data.to_vec(),
            commands: Vec::with_capacity(header.ncmds as usize),
        };
        image.parse_load_commands()?;

        debug!(
            "parsed {} ({} load commands, {} bytes)",
            image.header,
            image.commands.len(),
            image.data.len()
        );

        Ok(image)
    }

    fn parse_load_commands(&mut self) -> Result<()> {
        let mut offset = MachHeader64::SIZE;
        let end_offset = MachHeader64::SIZE + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset
                || offset + LoadCommand::SIZE > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&self.data[offset..])
                .map_err(|_| Error::LoadCommandOverflow { offset })?
                .0;

            let cmdsize = lc.cmdsize as usize;
            if cmdsize < LoadCommand::SIZE || offset + cmdsize > end_offset {
                return Err(Error::LoadCommandOverflow { offset });
            }

            self.commands.push(LoadCommandRecord::new(
                lc.cmd,
                self.data[offset..offset + cmdsize].to_vec(),
            ));
            offset += cmdsize;
        }

        Ok(())
    }

    // ==================== Queries ====================

    /// Returns the slice's architecture as the toolchain spells it.
    pub fn arch_name(&self) -> Result<&'static str> {
        self.header.arch_name().ok_or(Error::UnknownCpuType {
            cputype: self.header.cputype,
            cpusubtype: self.header.cpusubtype,
        })
    }

    /// Returns the parsed load command records.
    pub fn commands(&self) -> &[LoadCommandRecord] {
        &self.commands
    }

    /// Returns the load command records for mutation.
    pub fn commands_mut(&mut self) -> &mut Vec<LoadCommandRecord> {
        &mut self.commands
    }

    /// Returns the first record of the given command type.
    pub fn find_command(&self, cmd: u32) -> Option<&LoadCommandRecord> {
        self.commands.iter().find(|c| c.cmd == cmd)
    }

    /// Returns the dependency dylib names in declaration order.
    pub fn dependency_names(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.is_dependency())
            .filter_map(|c| c.dylib_name())
            .collect()
    }

    /// Returns true if the image binds through chained fixups instead of
    /// classic dyld info.
    pub fn has_chained_fixups(&self) -> bool {
        self.find_command(LC_DYLD_CHAINED_FIXUPS).is_some()
    }

    /// Returns the symbol table command, if present.
    pub fn symtab(&self) -> Option<SymtabCommand> {
        self.find_command(LC_SYMTAB).and_then(|c| c.read().ok())
    }

    /// Returns the dyld info command, if present.
    pub fn dyld_info(&self) -> Option<DyldInfoCommand> {
        self.commands
            .iter()
            .find(|c| c.cmd == LC_DYLD_INFO || c.cmd == LC_DYLD_INFO_ONLY)
            .and_then(|c| c.read().ok())
    }

    /// Returns a segment command and its record index by name.
    pub fn segment(&self, name: &str) -> Option<(usize, SegmentCommand64)> {
        self.commands.iter().enumerate().find_map(|(i, c)| {
            if c.cmd != LC_SEGMENT_64 {
                return None;
            }
            let seg: SegmentCommand64 = c.read().ok()?;
            (seg.name() == name).then_some((i, seg))
        })
    }

    /// Writes a segment command back into its record.
    pub fn update_segment(&mut self, index: usize, segment: &SegmentCommand64) -> Result<()> {
        self.commands[index].write(segment)
    }

    /// Returns a section header by segment and section name.
    pub fn find_section(&self, segment: &str, section: &str) -> Option<Section64> {
        let (index, seg) = self.segment(segment)?;
        let record = &self.commands[index];
        for i in 0..seg.nsects as usize {
            let base = SegmentCommand64::SIZE + i * Section64::SIZE;
            let sect = Section64::read_from_prefix(record.bytes.get(base..)?).ok()?.0;
            if sect.name() == section {
                return Some(sect);
            }
        }
        None
    }

    /// Removes a section header from its segment command, optionally zeroing
    /// the section's file contents.
    pub fn remove_section(
        &mut self,
        segment: &str,
        section: &str,
        zero_contents: bool,
    ) -> Result<()> {
        let (index, mut seg) = self.segment(segment).ok_or_else(|| Error::SectionNotFound {
            segment: segment.into(),
            section: section.into(),
        })?;

        let mut found = None;
        {
            let record = &self.commands[index];
            for i in 0..seg.nsects as usize {
                let base = SegmentCommand64::SIZE + i * Section64::SIZE;
                let slice = record
                    .bytes
                    .get(base..)
                    .ok_or_else(|| Error::buffer_too_small(base, record.bytes.len()))?;
                let sect = Section64::read_from_prefix(slice)
                    .map_err(|_| Error::buffer_too_small(base + Section64::SIZE, record.bytes.len()))?
                    .0;
                if sect.name() == section {
                    found = Some((base, sect));
                    break;
                }
            }
        }

        let (base, sect) = found.ok_or_else(|| Error::SectionNotFound {
            segment: segment.into(),
            section: section.into(),
        })?;

        if zero_contents && sect.offset != 0 {
            let start = sect.offset as usize;
            let end = start + sect.size as usize;
            if end > self.data.len() {
                return Err(Error::buffer_too_small(end, self.data.len()));
            }
            self.data[start..end].fill(0);
        }

        let record = &mut self.commands[index];
        record.bytes.drain(base..base + Section64::SIZE);
        seg.nsects -= 1;
        seg.cmdsize -= Section64::SIZE as u32;
        record.write(&seg)
    }

    // ==================== Raw Data Access ====================

    /// Reads data at the specified offset within the slice.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset + len > self.data.len() {
            return Err(Error::buffer_too_small(offset + len, self.data.len()));
        }
        Ok(&self.data[offset..offset + len])
    }

    /// Returns a mutable region of the slice, for in-place stream patching.
    pub fn region_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        if offset + len > self.data.len() {
            return Err(Error::buffer_too_small(offset + len, self.data.len()));
        }
        Ok(&mut self.data[offset..offset + len])
    }

    /// Truncates the slice, dropping trailing bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Returns the slice length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the slice holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // ==================== Symbol Table Access ====================

    /// Reads one symbol table entry.
    pub fn nlist(&self, symtab: &SymtabCommand, index: usize) -> Result<Nlist64> {
        let offset = symtab.symoff as usize + index * Nlist64::SIZE;
        let bytes = self.read_at(offset, Nlist64::SIZE)?;
        Ok(Nlist64::read_from_prefix(bytes)
            .map_err(|_| Error::buffer_too_small(Nlist64::SIZE, bytes.len()))?
            .0)
    }

    /// Writes one symbol table entry back.
    pub fn set_nlist(&mut self, symtab: &SymtabCommand, index: usize, sym: &Nlist64) -> Result<()> {
        let offset = symtab.symoff as usize + index * Nlist64::SIZE;
        let region = self.region_mut(offset, Nlist64::SIZE)?;
        region.copy_from_slice(sym.as_bytes());
        Ok(())
    }

    /// Resolves a symbol's name through the string table.
    pub fn symbol_name(&self, symtab: &SymtabCommand, sym: &Nlist64) -> Result<String> {
        let start = symtab.stroff as usize + sym.n_strx as usize;
        let strtab_end = (symtab.stroff as usize + symtab.strsize as usize).min(self.data.len());
        if start >= strtab_end {
            return Err(Error::buffer_too_small(start + 1, strtab_end));
        }
        let tail = &self.data[start..strtab_end];
        let end = util::memchr_null(tail);
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    // ==================== Rebuild & Serialization ====================

    /// Returns the first file offset holding non-command content.
    ///
    /// The rebuilt command region must stay below this boundary. Candidates
    /// are every non-zero section offset plus the linkedit tables, so the
    /// check holds even for images without mapped sections.
    pub fn first_content_offset(&self) -> usize {
        let mut min = self.data.len();
        let mut consider = |offset: u32| {
            if offset != 0 && (offset as usize) < min {
                min = offset as usize;
            }
        };

        for record in &self.commands {
            match record.cmd {
                LC_SEGMENT_64 => {
                    if let Ok(seg) = record.read::<SegmentCommand64>() {
                        for i in 0..seg.nsects as usize {
                            let base = SegmentCommand64::SIZE + i * Section64::SIZE;
                            let sect = record
                                .bytes
                                .get(base..)
                                .and_then(|s| Section64::read_from_prefix(s).ok());
                            if let Some((sect, _)) = sect {
                                consider(sect.offset);
                            }
                        }
                    }
                }
                LC_SYMTAB => {
                    if let Ok(symtab) = record.read::<SymtabCommand>() {
                        consider(symtab.symoff);
                        consider(symtab.stroff);
                    }
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    if let Ok(info) = record.read::<DyldInfoCommand>() {
                        consider(info.rebase_off);
                        consider(info.bind_off);
                        consider(info.weak_bind_off);
                        consider(info.lazy_bind_off);
                        consider(info.export_off);
                    }
                }
                LC_CODE_SIGNATURE | LC_SEGMENT_SPLIT_INFO | LC_FUNCTION_STARTS
                | LC_DATA_IN_CODE | LC_DYLD_EXPORTS_TRIE | LC_DYLD_CHAINED_FIXUPS => {
                    if let Ok(le) = record.read::<LinkeditDataCommand>() {
                        consider(le.dataoff);
                    }
                }
                _ => {}
            }
        }

        min
    }

    /// Serializes the command records back into the command region and
    /// refreshes the header.
    ///
    /// Slack between the new command end and the old one is zeroed so stale
    /// command bytes never survive a removal.
    pub fn rebuild(&mut self) -> Result<()> {
        let new_size: usize = self.commands.iter().map(|c| c.cmdsize()).sum();
        let limit = self.first_content_offset();

        if MachHeader64::SIZE + new_size > limit {
            return Err(Error::InsufficientLoadCommandSpace {
                needed: MachHeader64::SIZE + new_size,
                available: limit.saturating_sub(MachHeader64::SIZE),
            });
        }

        let old_end = MachHeader64::SIZE + self.header.sizeofcmds as usize;

        let Self { commands, data, .. } = self;
        let mut offset = MachHeader64::SIZE;
        for record in commands.iter() {
            data[offset..offset + record.cmdsize()].copy_from_slice(&record.bytes);
            offset += record.cmdsize();
        }
        if offset < old_end && old_end <= data.len() {
            data[offset..old_end].fill(0);
        }

        self.header.ncmds = self.commands.len() as u32;
        self.header.sizeofcmds = new_size as u32;
        self.data[..MachHeader64::SIZE].copy_from_slice(self.header.as_bytes());

        Ok(())
    }

    /// Returns the raw slice bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
