//! Architecture selection for fat (universal) binaries.
//!
//! A fat file starts with a big-endian header followed by a table of
//! architecture entries, each naming the CPU type/subtype and file range of a
//! thin slice. Selection walks the table in order and takes the first match.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use super::constants::*;
use super::structs::FatArch;
use crate::error::{Error, Result};
use crate::util::{read_u32_be_at, read_u64_be_at};

/// Known architecture names and their (cputype, cpusubtype) pairs.
///
/// A subtype of 0 matches every subtype of the CPU type.
const ARCH_TABLE: &[(&str, u32, u32)] = &[
    ("i386", CPU_TYPE_X86, 0),
    ("x86_64", CPU_TYPE_X86_64, 0),
    ("x86_64h", CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H),
    ("arm", CPU_TYPE_ARM, 0),
    ("armv6", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6),
    ("armv7", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7),
    ("armv7s", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7S),
    ("armv7k", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K),
    ("arm64", CPU_TYPE_ARM64, 0),
    ("arm64e", CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E),
    ("arm64_32", CPU_TYPE_ARM64_32, CPU_SUBTYPE_ARM64_32_V8),
    ("ppc", CPU_TYPE_POWERPC, 0),
    ("ppc64", CPU_TYPE_POWERPC64, 0),
];

/// Which slice of a fat binary to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchSelector {
    /// Take the first entry of the architecture table.
    #[default]
    Any,
    /// Take the first entry with this CPU type (and subtype, unless it is 0).
    Cpu {
        /// CPU type
        cputype: u32,
        /// CPU subtype, 0 for any
        cpusubtype: u32,
    },
}

impl ArchSelector {
    /// Looks up an architecture name in the selector table.
    ///
    /// `"any"` and `"all"` select the wildcard. Returns `None` for names not in
    /// the table.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("any") || name.eq_ignore_ascii_case("all") {
            return Some(ArchSelector::Any);
        }
        ARCH_TABLE
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, cputype, cpusubtype)| ArchSelector::Cpu {
                cputype,
                cpusubtype,
            })
    }

    /// Resolves an optional name, treating unknown names as the wildcard.
    pub fn resolve(name: Option<&str>) -> Self {
        match name {
            None => ArchSelector::Any,
            Some(n) => ArchSelector::from_name(n).unwrap_or_else(|| {
                warn!("unknown architecture \"{}\", using the first slice", n);
                ArchSelector::Any
            }),
        }
    }

    /// Returns true if this selector accepts the given fat-table entry.
    pub fn matches(&self, cputype: u32, cpusubtype: u32) -> bool {
        match *self {
            ArchSelector::Any => true,
            ArchSelector::Cpu {
                cputype: want_type,
                cpusubtype: want_sub,
            } => {
                cputype == want_type
                    && (want_sub == 0 || (cpusubtype & !CPU_SUBTYPE_MASK) == want_sub)
            }
        }
    }
}

impl FromStr for ArchSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ArchSelector::from_name(s).ok_or_else(|| Error::UnknownArchitecture(s.to_string()))
    }
}

impl fmt::Display for ArchSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ArchSelector::Any => f.write_str("any"),
            ArchSelector::Cpu {
                cputype,
                cpusubtype,
            } => match ARCH_TABLE
                .iter()
                .find(|&&(_, t, s)| t == cputype && s == cpusubtype)
            {
                Some((name, _, _)) => f.write_str(name),
                None => write!(f, "cpu({:#x}, {:#x})", cputype, cpusubtype),
            },
        }
    }
}

/// Returns true if `data` starts with a fat header.
pub fn is_fat(data: &[u8]) -> bool {
    matches!(read_u32_be_at(data, 0), Some(FAT_MAGIC | FAT_MAGIC_64))
}

/// Parses the architecture table of a fat binary.
///
/// Returns an empty list for thin images. Entries past the end of the data are
/// dropped.
pub fn parse_fat_arches(data: &[u8]) -> Vec<FatArch> {
    let magic = match read_u32_be_at(data, 0) {
        Some(m @ (FAT_MAGIC | FAT_MAGIC_64)) => m,
        _ => return Vec::new(),
    };
    let nfat_arch = read_u32_be_at(data, 4).unwrap_or(0) as usize;
    let entry_size = if magic == FAT_MAGIC_64 {
        FatArch::SIZE_64
    } else {
        FatArch::SIZE
    };

    let mut arches = Vec::with_capacity(nfat_arch.min(64));
    for i in 0..nfat_arch {
        let off = FatArch::HEADER_SIZE + i * entry_size;
        let entry = if magic == FAT_MAGIC_64 {
            read_fat_arch_64(data, off)
        } else {
            read_fat_arch(data, off)
        };
        match entry {
            Some(arch) => arches.push(arch),
            None => {
                warn!("fat architecture table truncated after {} entries", i);
                break;
            }
        }
    }
    arches
}

fn read_fat_arch(data: &[u8], off: usize) -> Option<FatArch> {
    Some(FatArch {
        cputype: read_u32_be_at(data, off)?,
        cpusubtype: read_u32_be_at(data, off + 4)?,
        offset: u64::from(read_u32_be_at(data, off + 8)?),
        size: u64::from(read_u32_be_at(data, off + 12)?),
        align: read_u32_be_at(data, off + 16)?,
    })
}

fn read_fat_arch_64(data: &[u8], off: usize) -> Option<FatArch> {
    Some(FatArch {
        cputype: read_u32_be_at(data, off)?,
        cpusubtype: read_u32_be_at(data, off + 4)?,
        offset: read_u64_be_at(data, off + 8)?,
        size: read_u64_be_at(data, off + 16)?,
        align: read_u32_be_at(data, off + 24)?,
    })
}

/// Selects the first table entry accepted by `selector`.
pub fn select_arch(arches: &[FatArch], selector: ArchSelector) -> Option<&FatArch> {
    arches
        .iter()
        .find(|arch| selector.matches(arch.cputype, arch.cpusubtype))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fat_with(entries: &[(u32, u32, u32)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        data.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for &(cputype, cpusubtype, offset) in entries {
            data.extend_from_slice(&cputype.to_be_bytes());
            data.extend_from_slice(&cpusubtype.to_be_bytes());
            data.extend_from_slice(&offset.to_be_bytes());
            data.extend_from_slice(&0x100u32.to_be_bytes());
            data.extend_from_slice(&12u32.to_be_bytes());
        }
        data
    }

    /// 32-byte entries with 64-bit offsets and sizes.
    fn fat64_with(entries: &[(u32, u32, u64)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&FAT_MAGIC_64.to_be_bytes());
        data.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for &(cputype, cpusubtype, offset) in entries {
            data.extend_from_slice(&cputype.to_be_bytes());
            data.extend_from_slice(&cpusubtype.to_be_bytes());
            data.extend_from_slice(&offset.to_be_bytes());
            data.extend_from_slice(&0x100u64.to_be_bytes());
            data.extend_from_slice(&14u32.to_be_bytes());
            data.extend_from_slice(&0u32.to_be_bytes());
        }
        data
    }

    #[test]
    fn test_from_name() {
        assert_eq!(ArchSelector::from_name("any"), Some(ArchSelector::Any));
        assert_eq!(
            ArchSelector::from_name("armv7"),
            Some(ArchSelector::Cpu {
                cputype: CPU_TYPE_ARM,
                cpusubtype: CPU_SUBTYPE_ARM_V7
            })
        );
        assert_eq!(ArchSelector::from_name("sparc"), None);
        assert!("sparc".parse::<ArchSelector>().is_err());
        assert_eq!(ArchSelector::resolve(Some("sparc")), ArchSelector::Any);
        assert_eq!(ArchSelector::resolve(None), ArchSelector::Any);
    }

    #[test]
    fn test_display_round_trips_names() {
        for name in ["any", "armv7", "arm64e", "x86_64"] {
            let sel: ArchSelector = name.parse().unwrap();
            assert_eq!(sel.to_string(), name);
        }
    }

    #[test]
    fn test_subtype_zero_matches_any_subtype() {
        let arm64 = ArchSelector::from_name("arm64").unwrap();
        assert!(arm64.matches(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E | 0x8000_0000));
        assert!(!arm64.matches(CPU_TYPE_ARM, 0));

        let arm64e = ArchSelector::from_name("arm64e").unwrap();
        assert!(arm64e.matches(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E | 0x8000_0000));
        assert!(!arm64e.matches(CPU_TYPE_ARM64, 0));
    }

    #[test]
    fn test_parse_and_select() {
        let data = fat_with(&[
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6, 0x1000),
            (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, 0x2000),
        ]);
        assert!(is_fat(&data));
        let arches = parse_fat_arches(&data);
        assert_eq!(arches.len(), 2);

        let any = select_arch(&arches, ArchSelector::Any).unwrap();
        assert_eq!(any.offset, 0x1000);

        let v7 = select_arch(&arches, "armv7".parse().unwrap()).unwrap();
        assert_eq!(v7.offset, 0x2000);

        assert!(select_arch(&arches, "x86_64".parse().unwrap()).is_none());

        let data = fat64_with(&[
            (CPU_TYPE_X86_64, 3, 0x4000),
            (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, 0x1_0000_8000),
        ]);
        assert!(is_fat(&data));
        let arches = parse_fat_arches(&data);
        assert_eq!(arches.len(), 2);
        assert_eq!(arches[0].size, 0x100);
        assert_eq!(arches[0].align, 14);

        let arm64e = select_arch(&arches, "arm64e".parse().unwrap()).unwrap();
        assert_eq!(arm64e.offset, 0x1_0000_8000);
        assert_eq!(select_arch(&arches, ArchSelector::Any).unwrap().offset, 0x4000);

        // a table cut short keeps the complete entries
        let truncated = &data[..FatArch::HEADER_SIZE + FatArch::SIZE_64 + 8];
        assert_eq!(parse_fat_arches(truncated).len(), 1);
    }

    #[test]
    fn test_truncated_table() {
        let mut data = fat_with(&[(CPU_TYPE_ARM, 0, 0x1000)]);
        data[7] = 3;
        assert_eq!(parse_fat_arches(&data).len(), 1);
        assert!(parse_fat_arches(b"\xfe\xed\xfa\xce").is_empty());
    }
}
