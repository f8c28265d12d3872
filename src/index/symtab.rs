//! Symbol table, external relocation and indirect symbol indexing.

use tracing::{debug, trace};
use zerocopy::FromBytes;

use super::SymbolTables;
use crate::macho::*;
use crate::util::{cstr_at, read_u32_le_at};

/// The symbol and string tables of an image.
pub(crate) struct SymbolSource<'a> {
    symbols: Vec<SymbolRecord>,
    strings: &'a [u8],
}

impl<'a> SymbolSource<'a> {
    /// Reads the nlist array and string table named by `LC_SYMTAB`.
    ///
    /// Entries running past the end of the file are dropped.
    pub(crate) fn load(ctx: &'a MachOContext) -> Option<Self> {
        let symtab = ctx.symtab()?;
        let entry_size = if ctx.is_64() { Nlist64::SIZE } else { Nlist::SIZE };
        let table = ctx.linkedit_bytes(
            u64::from(symtab.symoff),
            (symtab.nsyms as usize).saturating_mul(entry_size),
        );

        let symbols = table
            .chunks_exact(entry_size)
            .filter_map(|raw| {
                if ctx.is_64() {
                    Nlist64::read_from_bytes(raw).ok().map(SymbolRecord::from)
                } else {
                    Nlist::read_from_bytes(raw).ok().map(SymbolRecord::from)
                }
            })
            .collect();

        let strings = ctx.linkedit_bytes(u64::from(symtab.stroff), symtab.strsize as usize);

        Some(Self { symbols, strings })
    }

    /// Returns the symbol at `index`.
    #[inline]
    pub(crate) fn get(&self, index: usize) -> Option<&SymbolRecord> {
        self.symbols.get(index)
    }

    /// Returns the name of a symbol (empty when the string index is out of range).
    #[inline]
    pub(crate) fn name(&self, symbol: &SymbolRecord) -> &'a [u8] {
        cstr_at(self.strings, symbol.strx as usize).unwrap_or_default()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.symbols.len()
    }
}

/// Indexes symbol table entries, overwriting earlier writers.
pub(crate) fn index_symbol_table(source: &SymbolSource<'_>, tables: &mut SymbolTables) {
    let mut indexed = 0usize;
    for symbol in &source.symbols {
        if symbol.is_debug() || symbol.value == 0 {
            continue;
        }
        let address = symbol.address();
        tables.set_symbol(address, source.name(symbol));
        if symbol.is_external() {
            tables.mark_external(address);
            tables.add_ordinal(address, i32::from(symbol.library_ordinal()));
        }
        indexed += 1;
    }
    debug!("indexed {} of {} symbol table entries", indexed, source.len());
}

/// Indexes external relocations: each target slot is named after the symbol
/// it references.
pub(crate) fn index_external_relocations(
    ctx: &MachOContext,
    source: &SymbolSource<'_>,
    tables: &mut SymbolTables,
) {
    let Some(dysymtab) = ctx.dysymtab() else {
        return;
    };
    if dysymtab.nextrel == 0 {
        return;
    }

    let table = ctx.linkedit_bytes(
        u64::from(dysymtab.extreloff),
        dysymtab.nextrel as usize * RelocationInfo::SIZE,
    );

    let mut indexed = 0usize;
    for raw in table.chunks_exact(RelocationInfo::SIZE) {
        let Ok(reloc) = RelocationInfo::read_from_bytes(raw) else {
            continue;
        };
        if reloc.is_scattered() {
            continue;
        }
        let Some(symbol) = source.get(reloc.symbolnum() as usize) else {
            trace!("relocation references missing symbol {}", reloc.symbolnum());
            continue;
        };

        let address = u64::from(reloc.r_address) & !ADDRESS_MODE_BIT;
        tables.set_symbol(address, source.name(symbol));
        tables.add_ordinal(address, i32::from(symbol.library_ordinal()));
        indexed += 1;
    }
    debug!("indexed {} external relocations", indexed);
}

/// Indexes the slots of lazy/non-lazy pointer and stub sections through the
/// indirect symbol table.
pub(crate) fn index_indirect_symbols(
    ctx: &MachOContext,
    source: &SymbolSource<'_>,
    tables: &mut SymbolTables,
) {
    let Some(dysymtab) = ctx.dysymtab() else {
        return;
    };
    let indirect = ctx.linkedit_bytes(
        u64::from(dysymtab.indirectsymoff),
        dysymtab.nindirectsyms as usize * 4,
    );
    let pointer_width = ctx.pointer_width() as u64;

    let mut indexed = 0usize;
    for section in ctx.sections() {
        if !section.has_indirect_symbols() || ctx.section_encrypted(section) {
            continue;
        }

        let stride = match u64::from(section.reserved2) {
            0 => pointer_width,
            declared => declared,
        };
        let slots = section.size / stride;

        for slot in 0..slots {
            let Some(symbol_index) = (section.reserved1 as usize)
                .checked_add(slot as usize)
                .and_then(|index| index.checked_mul(4))
                .and_then(|at| read_u32_le_at(indirect, at))
            else {
                break;
            };
            if symbol_index & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
                continue;
            }
            let Some(symbol) = source.get(symbol_index as usize) else {
                continue;
            };

            let Some(address) = section.addr.checked_add(slot * stride) else {
                trace!("slot {} of {} overflows the address space", slot, section.full_name());
                break;
            };
            let address = address & !ADDRESS_MODE_BIT;
            tables.set_symbol(address, source.name(symbol));
            indexed += 1;
        }
    }
    debug!("indexed {} indirect symbol slots", indexed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{nlist32, nlist64, sect, strtab, ImageBuilder};

    fn image_with_dysymtab(extrel: bool) -> Vec<u8> {
        dysymtab_builder(extrel).build()
    }

    fn dysymtab_builder(extrel: bool) -> ImageBuilder {
        let (strings, offs) = strtab(&["_main", "_printf", "_malloc", "_stab"]);
        let symbols = nlist32(&[
            (offs[0], N_SECT | N_EXT, 0, 0x1801),
            (offs[1], N_UNDF | N_EXT, 0x0100, 0),
            (offs[2], N_UNDF | N_EXT, 0x0200, 0),
            (offs[3], 0x24, 0, 0x1900),
        ]);

        let mut indirect = Vec::new();
        for idx in [1u32, 2, INDIRECT_SYMBOL_LOCAL, 1] {
            indirect.extend_from_slice(&idx.to_le_bytes());
        }

        let mut reloc = Vec::new();
        if extrel {
            reloc.extend_from_slice(&0x2100u32.to_le_bytes());
            reloc.extend_from_slice(&(2u32 | (1 << 27)).to_le_bytes());
        }

        ImageBuilder::new32()
            .segment(
                "__TEXT",
                0x1000,
                0x1000,
                0,
                0x1000,
                &[
                    sect("__text", "__TEXT", 0x1800, 0x100, 0x800, 0),
                    sect("__stub", "__TEXT", 0x1a00, 0xc, 0xa00, S_SYMBOL_STUBS)
                        .reserved(0, 6),
                ],
            )
            .segment(
                "__DATA",
                0x2000,
                0x1000,
                0x1000,
                0x1000,
                &[sect("__la", "__DATA", 0x2000, 0x8, 0x1000, S_LAZY_SYMBOL_POINTERS)
                    .reserved(2, 0)],
            )
            .symtab(0x2000, 4, 0x2100, strings.len() as u32)
            .dysymtab_tables(0x2200, 4, 0x2300, if extrel { 1 } else { 0 })
            .place(0x2000, &symbols)
            .place(0x2100, &strings)
            .place(0x2200, &indirect)
            .place(0x2300, &reloc)
    }

    fn tables_for(data: Vec<u8>) -> SymbolTables {
        let ctx = MachOContext::from_bytes(data, ArchSelector::Any).unwrap();
        let mut tables = SymbolTables::default();
        let source = SymbolSource::load(&ctx).unwrap();
        index_symbol_table(&source, &mut tables);
        index_external_relocations(&ctx, &source, &mut tables);
        index_indirect_symbols(&ctx, &source, &mut tables);
        tables
    }

    #[test]
    fn test_symbol_table_entries() {
        let tables = tables_for(image_with_dysymtab(false));
        assert_eq!(tables.symbol(0x1800), Some(&b"_main"[..]));
        assert!(tables.is_external(0x1800));
        assert_eq!(tables.ordinal(0x1800), Some(0));
        // stabs and zero values are not indexed
        assert_eq!(tables.symbol(0x1900), None);
        assert_eq!(tables.symbol(0), None);
    }

    #[test]
    fn test_indirect_slots() {
        let tables = tables_for(image_with_dysymtab(false));
        // stubs: stride 6, reserved1 0 -> slots 0, 1
        assert_eq!(tables.symbol(0x1a00), Some(&b"_printf"[..]));
        assert_eq!(tables.symbol(0x1a06), Some(&b"_malloc"[..]));
        // lazy pointers: stride 4 (pointer width), reserved1 2 -> local, then _printf
        assert_eq!(tables.symbol(0x2000), None);
        assert_eq!(tables.symbol(0x2004), Some(&b"_printf"[..]));
    }

    #[test]
    fn test_slots_at_address_space_end() {
        let (strings, offs) = strtab(&["_printf", "_malloc"]);
        let symbols = nlist64(&[
            (offs[0], N_UNDF | N_EXT, 0x0100, 0),
            (offs[1], N_UNDF | N_EXT, 0x0100, 0),
        ]);
        let indirect: Vec<u8> = [0u32, 1, 0, 1].iter().flat_map(|i| i.to_le_bytes()).collect();
        let data = ImageBuilder::new64()
            .segment(
                "__DATA",
                0xFFFF_FFFF_FFFF_F000,
                0x1000,
                0x1000,
                0x1000,
                &[sect(
                    "__la_symbol_ptr",
                    "__DATA",
                    0xFFFF_FFFF_FFFF_FFF0,
                    0x20,
                    0x1FF0,
                    S_LAZY_SYMBOL_POINTERS,
                )],
            )
            .symtab(0x2000, 2, 0x2100, strings.len() as u32)
            .dysymtab_tables(0x2200, 4, 0, 0)
            .place(0x2000, &symbols)
            .place(0x2100, &strings)
            .place(0x2200, &indirect)
            .build();

        let tables = tables_for(data);
        assert_eq!(tables.symbol(0xFFFF_FFFF_FFFF_FFF0), Some(&b"_printf"[..]));
        assert_eq!(tables.symbol(0xFFFF_FFFF_FFFF_FFF8), Some(&b"_malloc"[..]));
        assert_eq!(tables.symbols.len(), 2);
    }

    #[test]
    fn test_encrypted_stub_section_is_skipped() {
        // covers __text and __stub, not __la
        let data = dysymtab_builder(false).encryption(0x800, 0x300, 1).build();
        let tables = tables_for(data);
        assert_eq!(tables.symbol(0x1a00), None);
        assert_eq!(tables.symbol(0x1a06), None);
        assert_eq!(tables.symbol(0x2004), Some(&b"_printf"[..]));
        assert_eq!(tables.symbol(0x1800), Some(&b"_main"[..]));
    }

    #[test]
    fn test_external_relocations() {
        let tables = tables_for(image_with_dysymtab(true));
        assert_eq!(tables.symbol(0x2100), Some(&b"_malloc"[..]));
        assert_eq!(tables.ordinal(0x2100), Some(2));
    }
}
