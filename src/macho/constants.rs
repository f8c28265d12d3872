//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 32-bit Mach-O magic (native little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;
/// 32-bit Mach-O magic (byte-swapped)
pub const MH_CIGAM: u32 = 0xCEFAEDFE;
/// 64-bit Mach-O magic (native little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;
/// 64-bit Mach-O magic (byte-swapped)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// FAT binary magic (read big-endian)
pub const FAT_MAGIC: u32 = 0xCAFEBABE;
/// FAT binary magic with 64-bit offsets (read big-endian)
pub const FAT_MAGIC_64: u32 = 0xCAFEBABF;

// =============================================================================
// File Types
// =============================================================================

/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;

// =============================================================================
// CPU Types
// =============================================================================

/// Wildcard CPU type used by fat-slice selection
pub const CPU_TYPE_ANY: i32 = -1;

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// ILP32 on a 64-bit architecture
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
/// ARM64_32 CPU type
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;
/// PowerPC CPU type
pub const CPU_TYPE_POWERPC: u32 = 18;
/// PowerPC64 CPU type
pub const CPU_TYPE_POWERPC64: u32 = CPU_TYPE_POWERPC | CPU_ARCH_ABI64;

// =============================================================================
// CPU Subtypes
// =============================================================================

/// Capability bits stored in the high byte of the subtype
pub const CPU_SUBTYPE_MASK: u32 = 0xFF00_0000;

/// ARMv6
pub const CPU_SUBTYPE_ARM_V6: u32 = 6;
/// ARMv7
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;
/// ARMv7s
pub const CPU_SUBTYPE_ARM_V7S: u32 = 11;
/// ARMv7k
pub const CPU_SUBTYPE_ARM_V7K: u32 = 12;
/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;
/// ARM64_32 v8
pub const CPU_SUBTYPE_ARM64_32_V8: u32 = 1;
/// x86_64 Haswell
pub const CPU_SUBTYPE_X86_64_H: u32 = 8;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Segment of this file
pub const LC_SEGMENT: u32 = 0x1;
/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a weak dynamically linked shared library
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Delay load of dylib
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Encrypted segment information
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// 64-bit encrypted segment information
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2C;

// =============================================================================
// Section Types
// =============================================================================

/// Section types mask
pub const SECTION_TYPE: u32 = 0x0000_00FF;

/// Regular section
pub const S_REGULAR: u32 = 0x0;
/// Zero fill on demand
pub const S_ZEROFILL: u32 = 0x1;
/// Section with literal C strings
pub const S_CSTRING_LITERALS: u32 = 0x2;
/// Section with non-lazy symbol pointers
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
/// Section with lazy symbol pointers
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
/// Section with symbol stubs
pub const S_SYMBOL_STUBS: u32 = 0x8;
/// Zero fill on demand (>4GB)
pub const S_GB_ZEROFILL: u32 = 0xC;
/// Section with only lazy symbol pointers to lazy loaded dylibs
pub const S_LAZY_DYLIB_SYMBOL_POINTERS: u32 = 0x10;
/// Thread local zerofill section
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;
/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

/// Thumb / mode bit carried in the low bit of symbol values
pub const ADDRESS_MODE_BIT: u64 = 1;

/// Extracts the two-level library ordinal from an `n_desc` field.
#[inline]
pub const fn get_library_ordinal(n_desc: u16) -> u8 {
    ((n_desc >> 8) & 0xFF) as u8
}

/// Ordinal referring to the image itself
pub const SELF_LIBRARY_ORDINAL: i32 = 0;

// =============================================================================
// Indirect Symbol Table
// =============================================================================

/// Symbol is local
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
/// Symbol is absolute
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

// =============================================================================
// Relocations
// =============================================================================

/// High bit of `r_address` marks a scattered relocation
pub const R_SCATTERED: u32 = 0x8000_0000;

// =============================================================================
// Bind Opcodes
// =============================================================================

/// Bind opcodes used in the dyld bind info.
///
/// These constants define the opcodes used in the compressed binding
/// information format found in LC_DYLD_INFO load commands.
#[allow(missing_docs)]
pub mod bind_opcodes {
    /// Terminates a binding sequence.
    pub const BIND_OPCODE_DONE: u8 = 0x00;
    pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
    pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
    pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
    pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
    pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
    pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
    pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
    pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
    pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
    pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
    pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
    pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
    pub const BIND_OPCODE_THREADED: u8 = 0xD0;

    pub const BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB: u8 = 0x00;
    pub const BIND_SUBOPCODE_THREADED_APPLY: u8 = 0x01;

    pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;
    pub const BIND_OPCODE_MASK: u8 = 0xF0;
}

// =============================================================================
// Export Flags
// =============================================================================

/// Export symbol kind mask.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
/// Regular export.
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
/// Thread-local variable.
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
/// Absolute symbol (not relative to any section).
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
/// Weak definition.
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
/// Re-export from another dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
/// Stub and resolver.
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

// =============================================================================
// Objective-C Runtime
// =============================================================================

/// class_ro_t flag marking a metaclass
pub const RO_META: u32 = 1 << 0;

/// Method list stores 32-bit relative offsets instead of pointers.
pub const METHOD_LIST_RELATIVE_FLAG: u32 = 0x8000_0000;
/// Relative method list selector offsets point at strings, not selrefs.
pub const METHOD_LIST_SELECTORS_DIRECT_FLAG: u32 = 0x4000_0000;
/// Mask for the entry size in a method or ivar list header.
pub const METHOD_LIST_ENTSIZE_MASK: u32 = 0x0000_FFFC;

/// CFString info flag set when the payload is stored as UTF-16.
pub const CFSTRING_INFO_UTF16: u64 = 0x10;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The file has its dynamic undefined references prebound
        const PREBOUND = 0x10;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The executable is forcing all images to use flat name space bindings
        const FORCE_FLAT = 0x100;
        /// The final linked image contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// The OS will load the main executable at a random address
        const PIE = 0x200000;
        /// Contains a section of type S_THREAD_LOCAL_VARIABLES
        const HAS_TLV_DESCRIPTORS = 0x800000;
        /// The code was linked for use in an application extension
        const APP_EXTENSION_SAFE = 0x2000000;
        /// The dylib is part of the dyld shared cache
        const DYLIB_IN_CACHE = 0x80000000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_ordinal_from_desc() {
        assert_eq!(get_library_ordinal(0x0200), 2);
        assert_eq!(get_library_ordinal(0xFE00), 0xFE);
        assert_eq!(get_library_ordinal(0x0010), 0);
    }

    #[test]
    fn test_header_flags_keep_unknown_bits() {
        let flags = MachOFlags::from_bits_retain(0x0020_0085);
        assert!(flags.contains(MachOFlags::PIE | MachOFlags::TWOLEVEL | MachOFlags::DYLDLINK));
        assert!(!flags.contains(MachOFlags::FORCE_FLAT));
    }
}
