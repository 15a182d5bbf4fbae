//! Shared fixtures for building synthetic Mach-O images in tests.
//!
//! `ImageBuilder` assembles a small but structurally honest MH_EXECUTE slice:
//! real segments, real section headers, a symbol table, dyld bind streams,
//! and the executable-only commands the conversion pipeline strips. Offsets
//! are laid out the way ld64 lays them out (commands, then mapped content,
//! then linkedit), so the images exercise the same bookkeeping paths as
//! binaries taken from disk.

use zerocopy::IntoBytes;

use super::constants::*;
use super::structs::*;
use crate::util::align_up;

/// File offset where mapped content starts unless `tight_command_space` is
/// requested.
const DEFAULT_CONTENT_BASE: usize = 0x1000;

const TEXT_STUB: [u8; 16] = [
    0xC0, 0x03, 0x5F, 0xD6, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

struct SymbolSpec {
    name: String,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    n_value: u64,
}

/// Builder for synthetic 64-bit Mach-O slices.
pub struct ImageBuilder {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    dylibs: Vec<(u32, String)>,
    identity: Option<String>,
    info_plist: Option<Vec<u8>>,
    symbols: Vec<SymbolSpec>,
    bind: Vec<u8>,
    weak_bind: Vec<u8>,
    lazy_bind: Vec<u8>,
    dylinker: bool,
    main_entry: bool,
    source_version: bool,
    version_min: Option<u32>,
    build_version: Option<u32>,
    code_signature: bool,
    chained_fixups: bool,
    tight: bool,
}

impl ImageBuilder {
    /// Starts an arm64 MH_EXECUTE image with __PAGEZERO, __TEXT, and
    /// __LINKEDIT segments.
    pub fn new() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            filetype: MH_EXECUTE,
            dylibs: Vec::new(),
            identity: None,
            info_plist: None,
            symbols: Vec::new(),
            bind: Vec::new(),
            weak_bind: Vec::new(),
            lazy_bind: Vec::new(),
            dylinker: false,
            main_entry: false,
            source_version: false,
            version_min: None,
            build_version: None,
            code_signature: false,
            chained_fixups: false,
            tight: false,
        }
    }

    pub fn cpu(mut self, cputype: u32, cpusubtype: u32) -> Self {
        self.cputype = cputype;
        self.cpusubtype = cpusubtype;
        self
    }

    pub fn filetype(mut self, filetype: u32) -> Self {
        self.filetype = filetype;
        self
    }

    /// Appends an LC_LOAD_DYLIB dependency.
    pub fn dylib(mut self, path: &str) -> Self {
        self.dylibs.push((LC_LOAD_DYLIB, path.to_string()));
        self
    }

    /// Appends an LC_LOAD_WEAK_DYLIB dependency.
    pub fn weak_dylib(mut self, path: &str) -> Self {
        self.dylibs.push((LC_LOAD_WEAK_DYLIB, path.to_string()));
        self
    }

    /// Adds an LC_ID_DYLIB command declaring the image's own install name.
    pub fn identity(mut self, path: &str) -> Self {
        self.identity = Some(path.to_string());
        self
    }

    /// Adds a `__TEXT,__info_plist` section holding the given bytes.
    pub fn info_plist(mut self, contents: &[u8]) -> Self {
        self.info_plist = Some(contents.to_vec());
        self
    }

    /// Adds an undefined external symbol bound to the given library ordinal.
    pub fn undefined_symbol(mut self, name: &str, ordinal: u8) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            n_type: N_UNDF | N_EXT,
            n_sect: 0,
            n_desc: (ordinal as u16) << 8,
            n_value: 0,
        });
        self
    }

    /// Like `undefined_symbol`, but with N_WEAK_REF set in the flag byte.
    pub fn undefined_weak_symbol(mut self, name: &str, ordinal: u8) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            n_type: N_UNDF | N_EXT,
            n_sect: 0,
            n_desc: N_WEAK_REF | ((ordinal as u16) << 8),
            n_value: 0,
        });
        self
    }

    /// Adds an external symbol defined in the __text section.
    pub fn defined_symbol(mut self, name: &str) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            n_type: N_SECT | N_EXT,
            n_sect: 1,
            n_desc: 0,
            n_value: 0x1_0000_0000 + DEFAULT_CONTENT_BASE as u64,
        });
        self
    }

    /// Adds a debugging (stab) symbol carrying an arbitrary `n_desc`.
    pub fn stab_symbol(mut self, name: &str, n_desc: u16) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            n_type: 0x64, // N_SO
            n_sect: 0,
            n_desc,
            n_value: 0,
        });
        self
    }

    pub fn bind_stream(mut self, stream: Vec<u8>) -> Self {
        self.bind = stream;
        self
    }

    pub fn weak_bind_stream(mut self, stream: Vec<u8>) -> Self {
        self.weak_bind = stream;
        self
    }

    pub fn lazy_bind_stream(mut self, stream: Vec<u8>) -> Self {
        self.lazy_bind = stream;
        self
    }

    /// Adds LC_LOAD_DYLINKER.
    pub fn dylinker(mut self) -> Self {
        self.dylinker = true;
        self
    }

    /// Adds LC_MAIN pointing at the __text stub.
    pub fn main_entry(mut self) -> Self {
        self.main_entry = true;
        self
    }

    /// Adds LC_SOURCE_VERSION.
    pub fn source_version(mut self) -> Self {
        self.source_version = true;
        self
    }

    /// Adds the given LC_VERSION_MIN_* command.
    pub fn version_min(mut self, cmd: u32) -> Self {
        self.version_min = Some(cmd);
        self
    }

    /// Adds LC_BUILD_VERSION for the given platform.
    pub fn build_version(mut self, platform: u32) -> Self {
        self.build_version = Some(platform);
        self
    }

    /// Adds LC_CODE_SIGNATURE with its blob at the very end of the file.
    pub fn code_signature(mut self) -> Self {
        self.code_signature = true;
        self
    }

    /// Adds LC_DYLD_CHAINED_FIXUPS with a small linkedit blob.
    pub fn chained_fixups(mut self) -> Self {
        self.chained_fixups = true;
        self
    }

    /// Starts mapped content immediately after the load commands, leaving no
    /// slack to grow into.
    pub fn tight_command_space(mut self) -> Self {
        self.tight = true;
        self
    }

    /// Serializes the image.
    pub fn build(self) -> Vec<u8> {
        let has_dyld_info =
            !self.bind.is_empty() || !self.weak_bind.is_empty() || !self.lazy_bind.is_empty();
        let has_symtab = !self.symbols.is_empty();
        let text_nsects = 1 + self.info_plist.is_some() as usize;

        // Command sizes first; content offsets depend on the total.
        let mut sizeofcmds = 0usize;
        let mut ncmds = 0usize;
        let mut add = |size: usize| {
            sizeofcmds += size;
            ncmds += 1;
        };
        add(SegmentCommand64::SIZE); // __PAGEZERO
        add(SegmentCommand64::SIZE + text_nsects * Section64::SIZE);
        add(SegmentCommand64::SIZE); // __LINKEDIT
        if has_dyld_info {
            add(DyldInfoCommand::SIZE);
        }
        if has_symtab {
            add(SymtabCommand::SIZE);
        }
        if self.dylinker {
            add(32);
        }
        if self.version_min.is_some() {
            add(16);
        }
        if self.build_version.is_some() {
            add(BuildVersionCommand::SIZE);
        }
        if self.source_version {
            add(16);
        }
        if self.main_entry {
            add(24);
        }
        if let Some(path) = &self.identity {
            add(align_up((DylibCommand::SIZE + path.len() + 1) as u64, 8) as usize);
        }
        for (_, path) in &self.dylibs {
            add(align_up((DylibCommand::SIZE + path.len() + 1) as u64, 8) as usize);
        }
        if self.chained_fixups {
            add(LinkeditDataCommand::SIZE);
        }
        if self.code_signature {
            add(LinkeditDataCommand::SIZE);
        }

        let commands_end = MachHeader64::SIZE + sizeofcmds;
        let content_base = if self.tight {
            commands_end
        } else {
            debug_assert!(commands_end <= DEFAULT_CONTENT_BASE);
            DEFAULT_CONTENT_BASE
        };

        // Mapped __TEXT content.
        let text_off = content_base;
        let plist_off = text_off + TEXT_STUB.len();
        let plist_len = self.info_plist.as_ref().map_or(0, Vec::len);
        let text_end = plist_off + plist_len;

        // Linkedit content.
        let linkedit_base = align_up(text_end as u64, 8) as usize;
        let bind_off = linkedit_base;
        let weak_off = bind_off + self.bind.len();
        let lazy_off = weak_off + self.weak_bind.len();
        let chained_off = lazy_off + self.lazy_bind.len();
        let chained_len = if self.chained_fixups { 8 } else { 0 };
        let symoff = chained_off + chained_len;
        let nlists_len = self.symbols.len() * Nlist64::SIZE;
        let stroff = symoff + nlists_len;

        let mut strtab = vec![0u8];
        let mut nlists = Vec::with_capacity(nlists_len);
        for spec in &self.symbols {
            let n_strx = strtab.len() as u32;
            strtab.extend_from_slice(spec.name.as_bytes());
            strtab.push(0);
            nlists.extend_from_slice(
                Nlist64 {
                    n_strx,
                    n_type: spec.n_type,
                    n_sect: spec.n_sect,
                    n_desc: spec.n_desc,
                    n_value: spec.n_value,
                }
                .as_bytes(),
            );
        }

        let linkedit_end = stroff + strtab.len();
        let sig_off = align_up(linkedit_end as u64, 16) as usize;
        let sig_len = if self.code_signature { 16 } else { 0 };
        let file_end = if self.code_signature { sig_off + sig_len } else { linkedit_end };

        // Emit commands with final offsets.
        let vmbase = 0x1_0000_0000u64;
        let text_vmsize = align_up(text_end as u64, 0x1000);
        let mut cmds: Vec<u8> = Vec::with_capacity(sizeofcmds);

        let mut pagezero = SegmentCommand64 {
            vmsize: vmbase,
            ..Default::default()
        };
        pagezero.set_name("__PAGEZERO");
        cmds.extend_from_slice(pagezero.as_bytes());

        let mut text = SegmentCommand64 {
            cmdsize: (SegmentCommand64::SIZE + text_nsects * Section64::SIZE) as u32,
            vmaddr: vmbase,
            vmsize: text_vmsize,
            fileoff: 0,
            filesize: text_end as u64,
            maxprot: 5,
            initprot: 5,
            nsects: text_nsects as u32,
            ..Default::default()
        };
        text.set_name("__TEXT");
        cmds.extend_from_slice(text.as_bytes());

        let mut text_sect = Section64 {
            addr: vmbase + text_off as u64,
            size: TEXT_STUB.len() as u64,
            offset: text_off as u32,
            align: 2,
            flags: 0x8000_0400,
            ..Default::default()
        };
        text_sect.sectname[..6].copy_from_slice(b"__text");
        text_sect.segname[..6].copy_from_slice(b"__TEXT");
        cmds.extend_from_slice(text_sect.as_bytes());

        if let Some(plist) = &self.info_plist {
            let mut plist_sect = Section64 {
                addr: vmbase + plist_off as u64,
                size: plist.len() as u64,
                offset: plist_off as u32,
                ..Default::default()
            };
            plist_sect.sectname[..12].copy_from_slice(b"__info_plist");
            plist_sect.segname[..6].copy_from_slice(b"__TEXT");
            cmds.extend_from_slice(plist_sect.as_bytes());
        }

        let mut linkedit = SegmentCommand64 {
            vmaddr: vmbase + text_vmsize,
            vmsize: align_up((file_end - linkedit_base) as u64, 0x1000),
            fileoff: linkedit_base as u64,
            filesize: (file_end - linkedit_base) as u64,
            maxprot: 1,
            initprot: 1,
            ..Default::default()
        };
        linkedit.set_name("__LINKEDIT");
        cmds.extend_from_slice(linkedit.as_bytes());

        if has_dyld_info {
            let info = DyldInfoCommand {
                bind_off: if self.bind.is_empty() { 0 } else { bind_off as u32 },
                bind_size: self.bind.len() as u32,
                weak_bind_off: if self.weak_bind.is_empty() { 0 } else { weak_off as u32 },
                weak_bind_size: self.weak_bind.len() as u32,
                lazy_bind_off: if self.lazy_bind.is_empty() { 0 } else { lazy_off as u32 },
                lazy_bind_size: self.lazy_bind.len() as u32,
                ..Default::default()
            };
            cmds.extend_from_slice(info.as_bytes());
        }

        if has_symtab {
            let symtab = SymtabCommand {
                symoff: symoff as u32,
                nsyms: self.symbols.len() as u32,
                stroff: stroff as u32,
                strsize: strtab.len() as u32,
                ..Default::default()
            };
            cmds.extend_from_slice(symtab.as_bytes());
        }

        if self.dylinker {
            let mut lc = Vec::with_capacity(32);
            lc.extend_from_slice(&LC_LOAD_DYLINKER.to_le_bytes());
            lc.extend_from_slice(&32u32.to_le_bytes());
            lc.extend_from_slice(&12u32.to_le_bytes());
            lc.extend_from_slice(b"/usr/lib/dyld\0\0\0\0\0\0\0");
            cmds.extend_from_slice(&lc);
        }

        if let Some(cmd) = self.version_min {
            cmds.extend_from_slice(&cmd.to_le_bytes());
            cmds.extend_from_slice(&16u32.to_le_bytes());
            cmds.extend_from_slice(&pack_version(10, 15, 0).to_le_bytes());
            cmds.extend_from_slice(&pack_version(10, 15, 0).to_le_bytes());
        }

        if let Some(platform) = self.build_version {
            let bv = BuildVersionCommand {
                platform,
                minos: pack_version(12, 0, 0),
                sdk: pack_version(12, 0, 0),
                ..Default::default()
            };
            cmds.extend_from_slice(bv.as_bytes());
        }

        if self.source_version {
            cmds.extend_from_slice(&LC_SOURCE_VERSION.to_le_bytes());
            cmds.extend_from_slice(&16u32.to_le_bytes());
            cmds.extend_from_slice(&0u64.to_le_bytes());
        }

        if self.main_entry {
            cmds.extend_from_slice(&LC_MAIN.to_le_bytes());
            cmds.extend_from_slice(&24u32.to_le_bytes());
            cmds.extend_from_slice(&(text_off as u64).to_le_bytes());
            cmds.extend_from_slice(&0u64.to_le_bytes());
        }

        if let Some(path) = &self.identity {
            push_dylib_command(&mut cmds, LC_ID_DYLIB, path);
        }
        for (cmd, path) in &self.dylibs {
            push_dylib_command(&mut cmds, *cmd, path);
        }

        if self.chained_fixups {
            let lc = LinkeditDataCommand {
                cmd: LC_DYLD_CHAINED_FIXUPS,
                cmdsize: LinkeditDataCommand::SIZE as u32,
                dataoff: chained_off as u32,
                datasize: chained_len as u32,
            };
            cmds.extend_from_slice(lc.as_bytes());
        }

        if self.code_signature {
            let lc = LinkeditDataCommand {
                cmd: LC_CODE_SIGNATURE,
                cmdsize: LinkeditDataCommand::SIZE as u32,
                dataoff: sig_off as u32,
                datasize: sig_len as u32,
            };
            cmds.extend_from_slice(lc.as_bytes());
        }

        debug_assert_eq!(cmds.len(), sizeofcmds);

        // Assemble the file.
        let header = MachHeader64 {
            cputype: self.cputype,
            cpusubtype: self.cpusubtype,
            filetype: self.filetype,
            ncmds: ncmds as u32,
            sizeofcmds: sizeofcmds as u32,
            flags: (MachOFlags::NOUNDEFS
                | MachOFlags::DYLDLINK
                | MachOFlags::TWOLEVEL
                | MachOFlags::PIE)
                .bits(),
            ..Default::default()
        };

        let mut data = vec![0u8; file_end];
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        data[MachHeader64::SIZE..commands_end].copy_from_slice(&cmds);
        data[text_off..text_off + TEXT_STUB.len()].copy_from_slice(&TEXT_STUB);
        if let Some(plist) = &self.info_plist {
            data[plist_off..plist_off + plist.len()].copy_from_slice(plist);
        }
        data[bind_off..bind_off + self.bind.len()].copy_from_slice(&self.bind);
        data[weak_off..weak_off + self.weak_bind.len()].copy_from_slice(&self.weak_bind);
        data[lazy_off..lazy_off + self.lazy_bind.len()].copy_from_slice(&self.lazy_bind);
        data[symoff..symoff + nlists.len()].copy_from_slice(&nlists);
        data[stroff..stroff + strtab.len()].copy_from_slice(&strtab);
        if self.code_signature {
            // Minimal superblob header, big-endian like codesign writes it
            data[sig_off..sig_off + 4].copy_from_slice(&0xFADE_0CC0u32.to_be_bytes());
            data[sig_off + 4..sig_off + 8].copy_from_slice(&(sig_len as u32).to_be_bytes());
        }

        data
    }
}

fn push_dylib_command(cmds: &mut Vec<u8>, cmd: u32, path: &str) {
    let cmdsize = align_up((DylibCommand::SIZE + path.len() + 1) as u64, 8) as usize;
    let record = DylibCommand {
        cmd,
        cmdsize: cmdsize as u32,
        dylib: Dylib {
            name_offset: DylibCommand::SIZE as u32,
            timestamp: 2,
            current_version: 0x0001_0000,
            compatibility_version: 0x0001_0000,
        },
    };
    let start = cmds.len();
    cmds.resize(start + cmdsize, 0);
    cmds[start..start + DylibCommand::SIZE].copy_from_slice(record.as_bytes());
    cmds[start + DylibCommand::SIZE..start + DylibCommand::SIZE + path.len()]
        .copy_from_slice(path.as_bytes());
}

// =============================================================================
// Bind Stream Builder
// =============================================================================

/// Builder for dyld bind opcode streams.
pub struct BindStreamBuilder {
    data: Vec<u8>,
}

impl BindStreamBuilder {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    fn push_uleb(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.data.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    /// BIND_OPCODE_SET_DYLIB_ORDINAL_IMM
    pub fn ordinal_imm(mut self, ordinal: u8) -> Self {
        debug_assert!(ordinal <= BIND_IMMEDIATE_MASK);
        self.data.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal);
        self
    }

    /// BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB
    pub fn ordinal_uleb(mut self, ordinal: u64) -> Self {
        self.data.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
        self.push_uleb(ordinal);
        self
    }

    /// BIND_OPCODE_SET_DYLIB_SPECIAL_IMM with the sentinel's low nibble.
    pub fn special(mut self, sentinel: i64) -> Self {
        self.data
            .push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | ((sentinel as u8) & BIND_IMMEDIATE_MASK));
        self
    }

    /// BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM with no flags.
    pub fn symbol(mut self, name: &str) -> Self {
        self.data.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        self
    }

    /// BIND_OPCODE_SET_TYPE_IMM (pointer).
    pub fn type_pointer(mut self) -> Self {
        self.data.push(BIND_OPCODE_SET_TYPE_IMM | 1);
        self
    }

    /// BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB
    pub fn segment_offset(mut self, segment: u8, offset: u64) -> Self {
        self.data
            .push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment);
        self.push_uleb(offset);
        self
    }

    /// BIND_OPCODE_DO_BIND
    pub fn do_bind(mut self) -> Self {
        self.data.push(BIND_OPCODE_DO_BIND);
        self
    }

    /// BIND_OPCODE_DONE
    pub fn done(mut self) -> Self {
        self.data.push(BIND_OPCODE_DONE);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

/// Encodes one eager bind entry the way ld64 lays it out.
pub fn bind_entry(ordinal: u8, symbol: &str) -> Vec<u8> {
    BindStreamBuilder::new()
        .ordinal_imm(ordinal)
        .symbol(symbol)
        .type_pointer()
        .segment_offset(1, 0)
        .do_bind()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::MachImage;

    #[test]
    fn test_builder_produces_parsable_executable() {
        let data = ImageBuilder::new()
            .dylib("/usr/lib/libSystem.B.dylib")
            .dylinker()
            .main_entry()
            .source_version()
            .undefined_symbol("_printf", 1)
            .code_signature()
            .build();

        let image = MachImage::parse(&data).unwrap();
        assert!(image.header.is_executable());
        assert_eq!(image.arch_name().unwrap(), "arm64");
        assert!(image.segment("__PAGEZERO").is_some());
        assert!(image.segment("__TEXT").is_some());
        assert!(image.segment("__LINKEDIT").is_some());
        assert!(image.find_command(LC_MAIN).is_some());

        let symtab = image.symtab().unwrap();
        assert_eq!(symtab.nsyms, 1);
        let sym = image.nlist(&symtab, 0).unwrap();
        assert_eq!(image.symbol_name(&symtab, &sym).unwrap(), "_printf");
        assert_eq!(sym.library_ordinal(), 1);
    }

    #[test]
    fn test_builder_signature_sits_at_eof() {
        let data = ImageBuilder::new().code_signature().build();
        let image = MachImage::parse(&data).unwrap();
        let sig: LinkeditDataCommand =
            image.find_command(LC_CODE_SIGNATURE).unwrap().read().unwrap();
        assert_eq!((sig.dataoff + sig.datasize) as usize, image.len());
    }

    #[test]
    fn test_bind_stream_builder_scans_clean() {
        use crate::macho::bind::{scan_stream, BindStreamKind};

        let stream = BindStreamBuilder::new()
            .ordinal_imm(2)
            .symbol("_malloc")
            .type_pointer()
            .segment_offset(1, 0x10)
            .do_bind()
            .done()
            .build();
        let scan = scan_stream(&stream, BindStreamKind::Bind).unwrap();
        assert_eq!(scan.bindings.len(), 1);
        assert_eq!(scan.bindings[0].name, "_malloc");
        assert_eq!(scan.bindings[0].ordinal, 2);
    }
}
