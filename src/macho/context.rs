//! Mach-O context: container loading and address translation.
//!
//! [`MachOContext`] maps an image, picks the requested slice out of a fat
//! container, walks the load commands and keeps the segment/section layout.
//! Every other component reads image bytes through it, either by file offset
//! or by virtual address.

use std::fmt;
use std::fs::File;
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, warn};
use zerocopy::FromBytes;

use super::arch::{is_fat, parse_fat_arches, select_arch, ArchSelector};
use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::{cstr_at, fixed_name, read_ptr_le_at, read_u32_le_at};

// =============================================================================
// Image Data
// =============================================================================

/// Backing storage for an image: a read-only file mapping or an owned buffer.
pub enum ImageData {
    /// Memory-mapped file
    Mapped(Mmap),
    /// In-memory copy
    Owned(Vec<u8>),
}

impl Deref for ImageData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ImageData::Mapped(map) => map,
            ImageData::Owned(buf) => buf,
        }
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageData::Mapped(map) => write!(f, "Mapped({} bytes)", map.len()),
            ImageData::Owned(buf) => write!(f, "Owned({} bytes)", buf.len()),
        }
    }
}

// =============================================================================
// Segment / Section
// =============================================================================

/// A section, normalized from either the 32-bit or 64-bit layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Name of the owning segment
    pub segment_name: String,
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset, relative to the start of the slice
    pub offset: u64,
    /// Type and attribute flags
    pub flags: u32,
    /// Indirect symbol index for pointer and stub sections
    pub reserved1: u32,
    /// Stub size for stub sections
    pub reserved2: u32,
}

impl Section {
    fn from_raw32(s: &Section32) -> Self {
        Self {
            name: fixed_name(&s.sectname).to_string(),
            segment_name: fixed_name(&s.segname).to_string(),
            addr: u64::from(s.addr),
            size: u64::from(s.size),
            offset: u64::from(s.offset),
            flags: s.flags,
            reserved1: s.reserved1,
            reserved2: s.reserved2,
        }
    }

    fn from_raw64(s: &Section64) -> Self {
        Self {
            name: fixed_name(&s.sectname).to_string(),
            segment_name: fixed_name(&s.segname).to_string(),
            addr: s.addr,
            size: s.size,
            offset: u64::from(s.offset),
            flags: s.flags,
            reserved1: s.reserved1,
            reserved2: s.reserved2,
        }
    }

    /// Returns the section type.
    #[inline]
    pub fn section_type(&self) -> u32 {
        self.flags & SECTION_TYPE
    }

    /// Returns true if this section has indirect symbol references.
    #[inline]
    pub fn has_indirect_symbols(&self) -> bool {
        matches!(
            self.section_type(),
            S_NON_LAZY_SYMBOL_POINTERS
                | S_LAZY_SYMBOL_POINTERS
                | S_SYMBOL_STUBS
                | S_LAZY_DYLIB_SYMBOL_POINTERS
        )
    }

    /// Returns true if this section holds C string literals.
    #[inline]
    pub fn is_cstring_literals(&self) -> bool {
        self.section_type() == S_CSTRING_LITERALS
    }

    /// Returns true if the section has no bytes in the file.
    #[inline]
    pub fn is_zerofill(&self) -> bool {
        matches!(
            self.section_type(),
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        )
    }

    /// Returns true if the virtual address lies in this section.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.size
    }

    /// Returns true if the slice-relative file offset lies in this section.
    #[inline]
    pub fn contains_offset(&self, offset: u64) -> bool {
        !self.is_zerofill() && offset >= self.offset && offset - self.offset < self.size
    }

    /// Returns the full name (segment,section).
    pub fn full_name(&self) -> String {
        format!("{},{}", self.segment_name, self.name)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Section {{ name: \"{},{}\", addr: {:#x}+{:#x}, offset: {:#x} }}",
            self.segment_name, self.name, self.addr, self.size, self.offset
        )
    }
}

/// A segment with its sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Segment name
    pub name: String,
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset, relative to the start of the slice
    pub fileoff: u64,
    /// Amount of file mapped
    pub filesize: u64,
    /// Sections in this segment
    pub sections: Vec<Section>,
}

impl Segment {
    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Returns true if the virtual address lies in this segment.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.vmaddr && addr - self.vmaddr < self.vmsize
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment {{ name: \"{}\", vm: {:#x}+{:#x}, file: {:#x}+{:#x}, sects: {} }}",
            self.name,
            self.vmaddr,
            self.vmsize,
            self.fileoff,
            self.filesize,
            self.sections.len()
        )
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Which flavor of dylib load command a dylib reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DylibKind {
    /// LC_LOAD_DYLIB
    Load,
    /// LC_LOAD_WEAK_DYLIB
    Weak,
    /// LC_REEXPORT_DYLIB
    Reexport,
    /// LC_LAZY_LOAD_DYLIB
    Lazy,
    /// LC_LOAD_UPWARD_DYLIB
    Upward,
    /// LC_ID_DYLIB (the image's own install name)
    Id,
}

impl DylibKind {
    fn from_cmd(cmd: u32) -> Option<Self> {
        Some(match cmd {
            LC_LOAD_DYLIB => DylibKind::Load,
            LC_LOAD_WEAK_DYLIB => DylibKind::Weak,
            LC_REEXPORT_DYLIB => DylibKind::Reexport,
            LC_LAZY_LOAD_DYLIB => DylibKind::Lazy,
            LC_LOAD_UPWARD_DYLIB => DylibKind::Upward,
            LC_ID_DYLIB => DylibKind::Id,
            _ => return None,
        })
    }

    /// Returns true for commands that add a dependency (and a library ordinal).
    #[inline]
    pub fn is_dependency(&self) -> bool {
        !matches!(self, DylibKind::Id)
    }
}

/// The interpreted payload of a load command.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandKind {
    /// Index into [`MachOContext::segments`].
    Segment(usize),
    Dylib { kind: DylibKind, name: String },
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    DyldInfo(DyldInfoCommand),
    EncryptionInfo { cryptoff: u32, cryptsize: u32, cryptid: u32 },
    Other,
}

/// One load command with its framing.
#[derive(Debug, Clone)]
pub struct LoadCommandInfo {
    /// Load command type
    pub cmd: u32,
    /// Self-reported size
    pub cmdsize: u32,
    /// Absolute file offset of the command
    pub offset: usize,
    /// Interpreted payload
    pub kind: LoadCommandKind,
}

// =============================================================================
// Section Hint
// =============================================================================

/// Caller-owned locality cache for address translation.
///
/// Repeated lookups that land in the same section skip the linear scan. A
/// hint is only an accelerator: passing a fresh one, or none, gives the same
/// results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionHint {
    index: Option<usize>,
}

impl SectionHint {
    /// Creates an empty hint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the section that satisfied the last lookup, if any.
    pub fn section_index(&self) -> Option<usize> {
        self.index
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// A loaded Mach-O slice.
///
/// Construction only fails when the file cannot be opened or a fat binary has
/// no slice for the requested architecture. A slice whose magic is not a
/// native Mach-O magic is kept but marked invalid, and address translation on
/// it becomes the identity.
#[derive(Debug)]
pub struct MachOContext {
    path: Option<PathBuf>,
    data: ImageData,
    origin: u64,
    valid: bool,
    header: HeaderInfo,
    load_commands: Vec<LoadCommandInfo>,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    encrypted: Option<Range<u64>>,
}

impl MachOContext {
    /// Maps the file at `path` and loads the slice chosen by `selector`.
    pub fn open<P: AsRef<Path>>(path: P, selector: ArchSelector) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        Self::from_data(ImageData::Mapped(mmap), Some(path), selector)
    }

    /// Loads an image from an in-memory buffer.
    pub fn from_bytes(data: Vec<u8>, selector: ArchSelector) -> Result<Self> {
        Self::from_data(ImageData::Owned(data), None, selector)
    }

    /// Loads an image from already-acquired backing storage.
    pub fn from_data(
        data: ImageData,
        path: Option<PathBuf>,
        selector: ArchSelector,
    ) -> Result<Self> {
        let mut origin = 0u64;

        if is_fat(&data) {
            let arches = parse_fat_arches(&data);
            let arch = select_arch(&arches, selector).ok_or_else(|| {
                Error::ArchitectureNotFound {
                    arch: selector.to_string(),
                    path: path.clone().unwrap_or_default(),
                }
            })?;
            debug!(
                "selected fat slice cputype={:#x} cpusubtype={:#x} at {:#x}",
                arch.cputype, arch.cpusubtype, arch.offset
            );
            origin = arch.offset;
        }

        let mut ctx = Self {
            path,
            data,
            origin,
            valid: false,
            header: HeaderInfo::default(),
            load_commands: Vec::new(),
            segments: Vec::new(),
            sections: Vec::new(),
            encrypted: None,
        };

        let magic = ctx.read_u32_at(origin).unwrap_or(0);
        if magic != MH_MAGIC && magic != MH_MAGIC_64 {
            debug!("magic {:#x} is not a native Mach-O magic; treating image as raw", magic);
            return Ok(ctx);
        }

        ctx.header = match ctx.parse_header(magic) {
            Ok(header) => header,
            Err(err) if err.is_recoverable() => {
                warn!("truncated Mach-O header, treating image as raw: {}", err);
                return Ok(ctx);
            }
            Err(err) => return Err(err),
        };
        ctx.valid = true;
        debug!("{}", ctx.header);

        ctx.parse_load_commands();

        Ok(ctx)
    }

    fn parse_header(&self, magic: u32) -> Result<HeaderInfo> {
        let start = self.origin as usize;
        let bytes = self.data.get(start..).unwrap_or_default();
        let header = if magic == MH_MAGIC_64 {
            MachHeader64::read_from_prefix(bytes)
                .map(|(h, _)| HeaderInfo::from(h))
                .map_err(|_| Error::buffer_too_small(MachHeader64::SIZE, bytes.len()))?
        } else {
            MachHeader::read_from_prefix(bytes)
                .map(|(h, _)| HeaderInfo::from(h))
                .map_err(|_| Error::buffer_too_small(MachHeader::SIZE, bytes.len()))?
        };
        Ok(header)
    }

    /// Walks all load commands, stopping at the first malformed one.
    fn parse_load_commands(&mut self) {
        let start = self.origin as usize + self.header.header_size();
        let end_offset = start
            .saturating_add(self.header.sizeofcmds as usize)
            .min(self.data.len());
        let mut offset = start;

        self.load_commands.reserve(self.header.ncmds.min(1024) as usize);

        for _ in 0..self.header.ncmds {
            match self.parse_load_command(offset, end_offset) {
                Ok(info) => {
                    offset += info.cmdsize as usize;
                    self.load_commands.push(info);
                }
                Err(err) => {
                    warn!("stopping load command walk: {}", err);
                    break;
                }
            }
        }

        debug!(
            "parsed {} load commands, {} segments, {} sections",
            self.load_commands.len(),
            self.segments.len(),
            self.sections.len()
        );
    }

    /// Parses a single load command at `offset`.
    fn parse_load_command(&mut self, offset: usize, end_offset: usize) -> Result<LoadCommandInfo> {
        if offset + LoadCommand::SIZE > end_offset {
            return Err(Error::LoadCommandOverflow { offset });
        }

        let lc = LoadCommand::read_from_prefix(&self.data[offset..])
            .map_err(|_| Error::parse(offset, "failed to parse load command"))?
            .0;

        let cmdsize = lc.cmdsize as usize;
        if cmdsize < LoadCommand::SIZE || offset + cmdsize > end_offset {
            return Err(Error::LoadCommandOverflow { offset });
        }

        let kind = {
            let cmd_data = &self.data[offset..offset + cmdsize];
            match lc.cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let segment = parse_segment(lc.cmd == LC_SEGMENT_64, cmd_data, offset)?;
                    self.sections.extend(segment.sections.iter().cloned());
                    self.segments.push(segment);
                    LoadCommandKind::Segment(self.segments.len() - 1)
                }

                LC_SYMTAB => LoadCommandKind::Symtab(
                    SymtabCommand::read_from_prefix(cmd_data)
                        .map_err(|_| Error::parse(offset, "failed to parse symtab command"))?
                        .0,
                ),

                LC_DYSYMTAB => LoadCommandKind::Dysymtab(
                    DysymtabCommand::read_from_prefix(cmd_data)
                        .map_err(|_| Error::parse(offset, "failed to parse dysymtab command"))?
                        .0,
                ),

                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => LoadCommandKind::DyldInfo(
                    DyldInfoCommand::read_from_prefix(cmd_data)
                        .map_err(|_| Error::parse(offset, "failed to parse dyld info command"))?
                        .0,
                ),

                LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
                    // Both layouts share the first five words.
                    let enc = EncryptionInfoCommand::read_from_prefix(cmd_data)
                        .map_err(|_| Error::parse(offset, "failed to parse encryption info"))?
                        .0;
                    LoadCommandKind::EncryptionInfo {
                        cryptoff: enc.cryptoff,
                        cryptsize: enc.cryptsize,
                        cryptid: enc.cryptid,
                    }
                }

                cmd => match DylibKind::from_cmd(cmd) {
                    Some(kind) => {
                        let dylib = DylibCommand::read_from_prefix(cmd_data)
                            .map_err(|_| Error::parse(offset, "failed to parse dylib command"))?
                            .0;
                        let name = cstr_at(cmd_data, dylib.dylib.name_offset as usize)
                            .map(|b| String::from_utf8_lossy(b).into_owned())
                            .unwrap_or_default();
                        LoadCommandKind::Dylib { kind, name }
                    }
                    None => LoadCommandKind::Other,
                },
            }
        };

        if let LoadCommandKind::EncryptionInfo {
            cryptoff,
            cryptsize,
            cryptid,
        } = kind
        {
            if cryptid != 0 {
                let begin = self.origin + u64::from(cryptoff);
                warn!(
                    "part of this binary is encrypted ({:#x}..{:#x}); results may not be meaningful, \
                     try an unencrypted version instead",
                    begin,
                    begin + u64::from(cryptsize)
                );
                self.encrypted = Some(begin..begin + u64::from(cryptsize));
            }
        }

        Ok(LoadCommandInfo {
            cmd: lc.cmd,
            cmdsize: lc.cmdsize,
            offset,
            kind,
        })
    }

    // =========================================================================
    // Layout Accessors
    // =========================================================================

    /// Returns true if the slice has a native Mach-O magic.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Returns true for 64-bit images.
    #[inline]
    pub fn is_64(&self) -> bool {
        self.header.is_64()
    }

    /// Pointer width of the image in bytes.
    #[inline]
    pub fn pointer_width(&self) -> usize {
        self.header.pointer_width()
    }

    /// The parsed header (all zero for invalid images).
    pub fn header(&self) -> &HeaderInfo {
        &self.header
    }

    /// Header flags.
    pub fn header_flags(&self) -> MachOFlags {
        MachOFlags::from_bits_retain(self.header.flags)
    }

    /// Absolute file offset of the selected slice.
    #[inline]
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Path the image was opened from, if it came from a file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All bytes of the underlying file.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// All load commands in file order.
    pub fn load_commands(&self) -> &[LoadCommandInfo] {
        &self.load_commands
    }

    /// All segments in load-command order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// All sections of all segments, in load-command order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Returns the index of the segment named `name`.
    pub fn segment_index_having_name(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name == name)
    }

    /// Returns a section by segment and section name.
    pub fn section_having_name(&self, segment: &str, section: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.segment_name == segment && s.name == section)
    }

    /// Virtual address the image expects its header at.
    ///
    /// This is the base of the segment that maps file offset 0, which is what
    /// export trie addresses are relative to.
    pub fn image_base(&self) -> u64 {
        self.segments
            .iter()
            .find(|s| s.fileoff == 0 && s.filesize > 0)
            .map(|s| s.vmaddr)
            .unwrap_or(0)
    }

    /// Returns the symbol table command.
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.load_commands.iter().find_map(|lc| match &lc.kind {
            LoadCommandKind::Symtab(cmd) => Some(cmd),
            _ => None,
        })
    }

    /// Returns the dynamic symbol table command.
    pub fn dysymtab(&self) -> Option<&DysymtabCommand> {
        self.load_commands.iter().find_map(|lc| match &lc.kind {
            LoadCommandKind::Dysymtab(cmd) => Some(cmd),
            _ => None,
        })
    }

    /// Returns the dyld info command.
    pub fn dyld_info(&self) -> Option<&DyldInfoCommand> {
        self.load_commands.iter().find_map(|lc| match &lc.kind {
            LoadCommandKind::DyldInfo(cmd) => Some(cmd),
            _ => None,
        })
    }

    /// Returns an iterator over every dylib reference, including the image's own id.
    pub fn dylibs(&self) -> impl Iterator<Item = (DylibKind, &str)> {
        self.load_commands.iter().filter_map(|lc| match &lc.kind {
            LoadCommandKind::Dylib { kind, name } => Some((*kind, name.as_str())),
            _ => None,
        })
    }

    /// Returns dependency dylibs in library-ordinal order (ordinal 1 first).
    pub fn dependent_dylibs(&self) -> impl Iterator<Item = &str> {
        self.dylibs()
            .filter(|(kind, _)| kind.is_dependency())
            .map(|(_, name)| name)
    }

    /// The image's own install name (LC_ID_DYLIB).
    pub fn self_path(&self) -> Option<&str> {
        self.dylibs()
            .find(|(kind, _)| *kind == DylibKind::Id)
            .map(|(_, name)| name)
    }

    /// Absolute file range of the encrypted region, if any.
    pub fn encrypted_range(&self) -> Option<Range<u64>> {
        self.encrypted.clone()
    }

    /// Returns true if the absolute file offset lies in the encrypted region.
    pub fn file_offset_encrypted(&self, offset: u64) -> bool {
        self.encrypted
            .as_ref()
            .is_some_and(|range| range.contains(&offset))
    }

    /// Returns true if the section's file data starts in the encrypted region.
    pub fn section_encrypted(&self, section: &Section) -> bool {
        self.file_offset_encrypted(self.origin + section.offset)
    }

    // =========================================================================
    // Address Translation
    // =========================================================================

    fn find_section(
        &self,
        hint: Option<&mut SectionHint>,
        pred: impl Fn(&Section) -> bool,
    ) -> Option<&Section> {
        match hint {
            Some(hint) => {
                if let Some(section) = hint.index.and_then(|i| self.sections.get(i)) {
                    if pred(section) {
                        return Some(section);
                    }
                }
                let (index, section) = self.sections.iter().enumerate().find(|(_, s)| pred(s))?;
                hint.index = Some(index);
                Some(section)
            }
            None => self.sections.iter().find(|s| pred(s)),
        }
    }

    /// Converts a virtual address to an absolute file offset.
    ///
    /// Invalid images translate as the identity. Address 0, addresses outside
    /// every section, and addresses in zero-fill sections have no file offset.
    pub fn to_file_offset(&self, vm_address: u64, hint: Option<&mut SectionHint>) -> Option<u64> {
        if !self.valid {
            return Some(vm_address);
        }
        if vm_address == 0 {
            return None;
        }

        let section = self.find_section(hint, |s| s.contains_addr(vm_address))?;
        if section.is_zerofill() {
            return None;
        }
        self.origin
            .checked_add(section.offset)?
            .checked_add(vm_address - section.addr)
    }

    /// Converts an absolute file offset to a virtual address.
    ///
    /// Invalid images translate as the identity.
    pub fn to_vm_address(&self, file_offset: u64, hint: Option<&mut SectionHint>) -> Option<u64> {
        if !self.valid {
            return Some(file_offset);
        }

        let relative = file_offset.checked_sub(self.origin)?;
        let section = self.find_section(hint, |s| s.contains_offset(relative))?;
        section.addr.checked_add(relative - section.offset)
    }

    // =========================================================================
    // Data Access
    // =========================================================================

    /// Returns `len` bytes at an absolute file offset.
    pub fn bytes_at(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.data.get(start..start.checked_add(len)?)
    }

    /// Returns the bytes from an absolute file offset to the end of the file.
    pub fn tail_at(&self, offset: u64) -> Option<&[u8]> {
        self.data.get(usize::try_from(offset).ok()?..)
    }

    /// Returns the C string at an absolute file offset.
    pub fn cstr_at(&self, offset: u64) -> Option<&[u8]> {
        cstr_at(&self.data, usize::try_from(offset).ok()?)
    }

    /// Reads a u32 at an absolute file offset.
    pub fn read_u32_at(&self, offset: u64) -> Option<u32> {
        read_u32_le_at(&self.data, usize::try_from(offset).ok()?)
    }

    /// Reads a pointer-width value at an absolute file offset.
    pub fn read_ptr_at(&self, offset: u64) -> Option<u64> {
        read_ptr_le_at(&self.data, usize::try_from(offset).ok()?, self.pointer_width())
    }

    /// Returns up to `len` bytes at a slice-relative offset, cut short at the
    /// end of the file.
    ///
    /// LINKEDIT tables and opcode streams are decoded from whatever is present;
    /// the decoders stop on their own at the truncation point.
    pub fn linkedit_bytes(&self, relative: u64, len: usize) -> &[u8] {
        let Some(tail) = self
            .origin
            .checked_add(relative)
            .and_then(|offset| self.tail_at(offset))
        else {
            return &[];
        };
        if tail.len() < len {
            warn!(
                "LINKEDIT range {:#x}+{:#x} runs past the end of the file",
                relative, len
            );
        }
        &tail[..tail.len().min(len)]
    }

    /// Returns `len` bytes at a virtual address.
    pub fn bytes_at_vm(
        &self,
        vm_address: u64,
        len: usize,
        hint: Option<&mut SectionHint>,
    ) -> Option<&[u8]> {
        self.bytes_at(self.to_file_offset(vm_address, hint)?, len)
    }

    /// Returns the C string at a virtual address.
    pub fn cstr_at_vm(&self, vm_address: u64, hint: Option<&mut SectionHint>) -> Option<&[u8]> {
        self.cstr_at(self.to_file_offset(vm_address, hint)?)
    }

    /// Reads a u32 at a virtual address.
    pub fn read_u32_at_vm(&self, vm_address: u64, hint: Option<&mut SectionHint>) -> Option<u32> {
        self.read_u32_at(self.to_file_offset(vm_address, hint)?)
    }

    /// Reads a pointer-width value at a virtual address.
    pub fn read_ptr_at_vm(&self, vm_address: u64, hint: Option<&mut SectionHint>) -> Option<u64> {
        self.read_ptr_at(self.to_file_offset(vm_address, hint)?)
    }

    /// Dereferences a pointer stored at `vm_address`.
    pub fn dereference(&self, vm_address: u64) -> Option<u64> {
        self.read_ptr_at_vm(vm_address, None)
    }
}

/// Parses a segment command and its trailing section records.
fn parse_segment(is_64: bool, cmd_data: &[u8], offset: usize) -> Result<Segment> {
    let (mut segment, nsects, header_size, sect_size) = if is_64 {
        let seg = SegmentCommand64::read_from_prefix(cmd_data)
            .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
            .0;
        let segment = Segment {
            name: seg.name().to_string(),
            vmaddr: seg.vmaddr,
            vmsize: seg.vmsize,
            fileoff: seg.fileoff,
            filesize: seg.filesize,
            sections: Vec::new(),
        };
        (segment, seg.nsects, SegmentCommand64::SIZE, Section64::SIZE)
    } else {
        let seg = SegmentCommand::read_from_prefix(cmd_data)
            .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
            .0;
        let segment = Segment {
            name: seg.name().to_string(),
            vmaddr: u64::from(seg.vmaddr),
            vmsize: u64::from(seg.vmsize),
            fileoff: u64::from(seg.fileoff),
            filesize: u64::from(seg.filesize),
            sections: Vec::new(),
        };
        (segment, seg.nsects, SegmentCommand::SIZE, Section32::SIZE)
    };

    let available = cmd_data.len().saturating_sub(header_size) / sect_size;
    if nsects as usize > available {
        warn!(
            "segment {} declares {} sections but its command holds {}",
            segment.name, nsects, available
        );
    }

    let count = (nsects as usize).min(available);
    segment.sections.reserve(count);
    for j in 0..count {
        let sect_data = &cmd_data[header_size + j * sect_size..];
        let section = if is_64 {
            Section64::read_from_prefix(sect_data)
                .map(|(s, _)| Section::from_raw64(&s))
                .map_err(|_| Error::parse(offset, "failed to parse section"))?
        } else {
            Section32::read_from_prefix(sect_data)
                .map(|(s, _)| Section::from_raw32(&s))
                .map_err(|_| Error::parse(offset, "failed to parse section"))?
        };
        segment.sections.push(section);
    }

    Ok(segment)
}
