//! Synthetic Mach-O images for unit tests.

use zerocopy::{FromZeros, IntoBytes};

use crate::macho::*;

/// Routes `tracing` output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A section to emit inside a segment command.
#[derive(Debug, Clone)]
pub struct SectionSpec {
    name: String,
    segment: String,
    addr: u64,
    size: u64,
    offset: u64,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

impl SectionSpec {
    pub fn reserved(mut self, reserved1: u32, reserved2: u32) -> Self {
        self.reserved1 = reserved1;
        self.reserved2 = reserved2;
        self
    }
}

pub fn sect(name: &str, segment: &str, addr: u64, size: u64, offset: u64, flags: u32) -> SectionSpec {
    SectionSpec {
        name: name.to_string(),
        segment: segment.to_string(),
        addr,
        size,
        offset,
        flags,
        reserved1: 0,
        reserved2: 0,
    }
}

fn fixed16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = name.len().min(16);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

/// Builds a little-endian Mach-O image: header, load commands, then raw
/// byte placements at absolute offsets.
pub struct ImageBuilder {
    is_64: bool,
    commands: Vec<Vec<u8>>,
    patches: Vec<(usize, u32)>,
    placements: Vec<(u64, Vec<u8>)>,
    min_len: u64,
}

impl ImageBuilder {
    pub fn new32() -> Self {
        Self::new(false)
    }

    pub fn new64() -> Self {
        Self::new(true)
    }

    fn new(is_64: bool) -> Self {
        Self {
            is_64,
            commands: Vec::new(),
            patches: Vec::new(),
            placements: Vec::new(),
            min_len: 0,
        }
    }

    fn command(mut self, bytes: Vec<u8>) -> Self {
        self.commands.push(bytes);
        self
    }

    pub fn segment(
        mut self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        sections: &[SectionSpec],
    ) -> Self {
        self.min_len = self.min_len.max(fileoff + filesize);
        let mut out = Vec::new();
        if self.is_64 {
            let mut cmd = SegmentCommand64::new_zeroed();
            cmd.cmd = LC_SEGMENT_64;
            cmd.cmdsize = (SegmentCommand64::SIZE + sections.len() * Section64::SIZE) as u32;
            cmd.segname = fixed16(name);
            cmd.vmaddr = vmaddr;
            cmd.vmsize = vmsize;
            cmd.fileoff = fileoff;
            cmd.filesize = filesize;
            cmd.nsects = sections.len() as u32;
            out.extend_from_slice(cmd.as_bytes());
            for section in sections {
                let mut s = Section64::new_zeroed();
                s.sectname = fixed16(&section.name);
                s.segname = fixed16(&section.segment);
                s.addr = section.addr;
                s.size = section.size;
                s.offset = section.offset as u32;
                s.flags = section.flags;
                s.reserved1 = section.reserved1;
                s.reserved2 = section.reserved2;
                out.extend_from_slice(s.as_bytes());
            }
        } else {
            let mut cmd = SegmentCommand::new_zeroed();
            cmd.cmd = LC_SEGMENT;
            cmd.cmdsize = (SegmentCommand::SIZE + sections.len() * Section32::SIZE) as u32;
            cmd.segname = fixed16(name);
            cmd.vmaddr = vmaddr as u32;
            cmd.vmsize = vmsize as u32;
            cmd.fileoff = fileoff as u32;
            cmd.filesize = filesize as u32;
            cmd.nsects = sections.len() as u32;
            out.extend_from_slice(cmd.as_bytes());
            for section in sections {
                let mut s = Section32::new_zeroed();
                s.sectname = fixed16(&section.name);
                s.segname = fixed16(&section.segment);
                s.addr = section.addr as u32;
                s.size = section.size as u32;
                s.offset = section.offset as u32;
                s.flags = section.flags;
                s.reserved1 = section.reserved1;
                s.reserved2 = section.reserved2;
                out.extend_from_slice(s.as_bytes());
            }
        }
        self.command(out)
    }

    pub fn symtab(self, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Self {
        let cmd = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff,
            nsyms,
            stroff,
            strsize,
        };
        self.command(cmd.as_bytes().to_vec())
    }

    pub fn dysymtab_tables(self, indirectsymoff: u32, nindirectsyms: u32, extreloff: u32, nextrel: u32) -> Self {
        let cmd = DysymtabCommand {
            cmd: LC_DYSYMTAB,
            cmdsize: DysymtabCommand::SIZE as u32,
            indirectsymoff,
            nindirectsyms,
            extreloff,
            nextrel,
            ..Default::default()
        };
        self.command(cmd.as_bytes().to_vec())
    }

    pub fn dyld_info(self, bind_off: u32, bind_size: u32, export_off: u32, export_size: u32) -> Self {
        self.dyld_info_full(DyldInfoCommand {
            bind_off,
            bind_size,
            export_off,
            export_size,
            ..Default::default()
        })
    }

    pub fn dyld_info_full(self, mut cmd: DyldInfoCommand) -> Self {
        cmd.cmd = LC_DYLD_INFO_ONLY;
        cmd.cmdsize = DyldInfoCommand::SIZE as u32;
        self.command(cmd.as_bytes().to_vec())
    }

    pub fn dylib(self, cmd: u32, name: &str) -> Self {
        let align = if self.is_64 { 8 } else { 4 };
        let size = (DylibCommand::SIZE + name.len() + 1).next_multiple_of(align);
        let header = DylibCommand {
            cmd,
            cmdsize: size as u32,
            dylib: Dylib {
                name_offset: DylibCommand::SIZE as u32,
                ..Default::default()
            },
        };
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(name.as_bytes());
        out.resize(size, 0);
        self.command(out)
    }

    pub fn encryption(self, cryptoff: u32, cryptsize: u32, cryptid: u32) -> Self {
        let out = if self.is_64 {
            EncryptionInfoCommand64 {
                cmd: LC_ENCRYPTION_INFO_64,
                cmdsize: EncryptionInfoCommand64::SIZE as u32,
                cryptoff,
                cryptsize,
                cryptid,
                pad: 0,
            }
            .as_bytes()
            .to_vec()
        } else {
            EncryptionInfoCommand {
                cmd: LC_ENCRYPTION_INFO,
                cmdsize: EncryptionInfoCommand::SIZE as u32,
                cryptoff,
                cryptsize,
                cryptid,
            }
            .as_bytes()
            .to_vec()
        };
        self.command(out)
    }

    /// An arbitrary command: header followed by `payload`.
    pub fn raw_command(self, cmd: u32, payload: &[u8]) -> Self {
        let mut out = LoadCommand {
            cmd,
            cmdsize: (LoadCommand::SIZE + payload.len()) as u32,
        }
        .as_bytes()
        .to_vec();
        out.extend_from_slice(payload);
        self.command(out)
    }

    /// Overwrites the `cmdsize` of command `index` when building.
    pub fn patch_cmdsize(mut self, index: usize, cmdsize: u32) -> Self {
        self.patches.push((index, cmdsize));
        self
    }

    /// Writes `bytes` at absolute file offset `offset`.
    pub fn place(mut self, offset: u64, bytes: &[u8]) -> Self {
        self.placements.push((offset, bytes.to_vec()));
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        for &(index, cmdsize) in &self.patches {
            self.commands[index][4..8].copy_from_slice(&cmdsize.to_le_bytes());
        }
        let sizeofcmds: usize = self.commands.iter().map(Vec::len).sum();

        let mut out = if self.is_64 {
            MachHeader64 {
                magic: MH_MAGIC_64,
                cputype: CPU_TYPE_ARM64,
                cpusubtype: 0,
                filetype: MH_EXECUTE,
                ncmds: self.commands.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: 0,
                reserved: 0,
            }
            .as_bytes()
            .to_vec()
        } else {
            MachHeader {
                magic: MH_MAGIC,
                cputype: CPU_TYPE_ARM,
                cpusubtype: CPU_SUBTYPE_ARM_V7,
                filetype: MH_EXECUTE,
                ncmds: self.commands.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: 0,
            }
            .as_bytes()
            .to_vec()
        };
        for cmd in &self.commands {
            out.extend_from_slice(cmd);
        }

        let end = self
            .placements
            .iter()
            .map(|(off, bytes)| off + bytes.len() as u64)
            .fold(self.min_len, u64::max);
        if (out.len() as u64) < end {
            out.resize(end as usize, 0);
        }
        for (off, bytes) in &self.placements {
            let off = *off as usize;
            out[off..off + bytes.len()].copy_from_slice(bytes);
        }
        out
    }
}

/// Wraps thin images in a fat container, slices aligned to 0x1000.
pub fn fat(slices: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&FAT_MAGIC.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = 0x1000usize;
    let mut layout = Vec::new();
    for (cputype, cpusubtype, data) in slices {
        out.extend_from_slice(&cputype.to_be_bytes());
        out.extend_from_slice(&cpusubtype.to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&12u32.to_be_bytes());
        layout.push((offset, data));
        offset = (offset + data.len()).next_multiple_of(0x1000);
    }
    for (offset, data) in layout {
        out.resize(offset, 0);
        out.extend_from_slice(data);
    }
    out
}

/// A string table starting with the conventional " \0" entry, and the
/// offset of each name in it.
pub fn strtab(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut table = b" \0".to_vec();
    let mut offsets = Vec::with_capacity(names.len());
    for name in names {
        offsets.push(table.len() as u32);
        table.extend_from_slice(name.as_bytes());
        table.push(0);
    }
    (table, offsets)
}

fn n_sect(n_type: u8) -> u8 {
    u8::from(n_type & N_TYPE == N_SECT)
}

/// 32-bit nlist entries from `(strx, n_type, n_desc, value)`.
pub fn nlist32(entries: &[(u32, u8, u16, u32)]) -> Vec<u8> {
    entries
        .iter()
        .flat_map(|&(n_strx, n_type, n_desc, n_value)| {
            Nlist {
                n_strx,
                n_type,
                n_sect: n_sect(n_type),
                n_desc,
                n_value,
            }
            .as_bytes()
            .to_vec()
        })
        .collect()
}

/// 64-bit nlist entries from `(strx, n_type, n_desc, value)`.
pub fn nlist64(entries: &[(u32, u8, u16, u64)]) -> Vec<u8> {
    entries
        .iter()
        .flat_map(|&(n_strx, n_type, n_desc, n_value)| {
            Nlist64 {
                n_strx,
                n_type,
                n_sect: n_sect(n_type),
                n_desc,
                n_value,
            }
            .as_bytes()
            .to_vec()
        })
        .collect()
}
