//! Address-keyed lookup tables.
//!
//! [`SymbolTables`] is filled once while an image loads and is read-only
//! afterwards. The build runs in a fixed order, and the order matters because
//! writers differ in whether they overwrite:
//!
//! 1. dyld-info binds (eager, weak, lazy), then exports: insert if absent
//! 2. symbol table entries: overwrite
//! 3. external relocations (images without dyld info only): overwrite
//! 4. indirect symbol slots: overwrite
//! 5. C-string pools and ObjC/CFString metadata: separate tables

pub mod objc;
pub(crate) mod symtab;

use std::collections::btree_map::Entry as BTreeEntry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use tracing::{debug, warn};

pub use objc::ObjCMethod;

use crate::dyld::{BindInterpreter, BindStreamKind, ExportTrieWalker};
use crate::macho::{MachOContext, EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE, EXPORT_SYMBOL_FLAGS_KIND_MASK};
use crate::LoadOptions;
use symtab::SymbolSource;

/// A bind record kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Virtual address of the bound slot
    pub address: u64,
    /// Imported symbol name
    pub symbol: Box<[u8]>,
    /// Library ordinal
    pub ordinal: i32,
    /// Addend in effect (not applied to `address`)
    pub addend: i64,
    /// Stream the record came from
    pub stream: BindStreamKind,
}

/// An exported symbol with its address rebased to the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Virtual address
    pub address: u64,
    /// Symbol name
    pub name: Box<[u8]>,
    /// Export flags
    pub flags: u64,
}

/// A C-string literal section usable as a string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CStringPool {
    /// Virtual address of the section
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// Absolute file offset of the section
    pub file_offset: u64,
}

impl CStringPool {
    /// Absolute file offset of `addr`, if it lies in this pool.
    #[inline]
    pub fn file_offset_of(&self, addr: u64) -> Option<u64> {
        let delta = addr.checked_sub(self.addr).filter(|&d| d < self.size)?;
        self.file_offset.checked_add(delta)
    }
}

/// Every lookup table built for one image.
#[derive(Debug, Default)]
pub struct SymbolTables {
    pub(crate) symbols: BTreeMap<u64, Box<[u8]>>,
    pub(crate) ordinals: HashMap<u64, i32>,
    pub(crate) external: HashSet<u64>,
    pub(crate) cfstrings: HashMap<u64, Box<[u8]>>,
    pub(crate) classes: HashMap<u64, Box<[u8]>>,
    pub(crate) selectors: HashMap<u64, Box<[u8]>>,
    pub(crate) protocols: HashMap<u64, Box<[u8]>>,
    pub(crate) ivars: HashMap<u64, Box<[u8]>>,
    pub(crate) methods: BTreeMap<u64, ObjCMethod>,
    pub(crate) cstring_pools: Vec<CStringPool>,
    pub(crate) binds: Vec<Binding>,
    pub(crate) exports: Vec<Export>,
}

impl SymbolTables {
    /// Builds all tables for a loaded image.
    ///
    /// Invalid images get empty tables. Decoding problems are logged and the
    /// affected table keeps whatever was decoded before the problem.
    pub fn build(ctx: &MachOContext, options: &LoadOptions) -> Self {
        let mut tables = Self::default();
        if !ctx.is_valid() {
            return tables;
        }

        if !options.skip_dyld_info {
            tables.index_dyld_info(ctx, options.max_trie_depth);
        }

        if let Some(source) = SymbolSource::load(ctx) {
            symtab::index_symbol_table(&source, &mut tables);
            if ctx.dyld_info().is_none() {
                symtab::index_external_relocations(ctx, &source, &mut tables);
            }
            symtab::index_indirect_symbols(ctx, &source, &mut tables);
        }

        tables.collect_cstring_pools(ctx);

        if !options.skip_objc {
            objc::scan(ctx, &mut tables);
        }

        debug!(
            "indexed {} symbols ({} binds, {} exports), {} cstring pools",
            tables.symbols.len(),
            tables.binds.len(),
            tables.exports.len(),
            tables.cstring_pools.len()
        );
        tables
    }

    fn index_dyld_info(&mut self, ctx: &MachOContext, max_trie_depth: usize) {
        let Some(info) = ctx.dyld_info().copied() else {
            return;
        };

        let bases: Vec<u64> = ctx.segments().iter().map(|s| s.vmaddr).collect();
        let interpreter = BindInterpreter::new(&bases, ctx.pointer_width());

        let streams = [
            (BindStreamKind::Eager, info.bind_off, info.bind_size),
            (BindStreamKind::Weak, info.weak_bind_off, info.weak_bind_size),
            (BindStreamKind::Lazy, info.lazy_bind_off, info.lazy_bind_size),
        ];
        for (kind, off, size) in streams {
            if size == 0 {
                continue;
            }
            let stream = ctx.linkedit_bytes(u64::from(off), size as usize);
            for record in interpreter.run(stream, kind) {
                if record.symbol.is_empty() {
                    continue;
                }
                self.insert_symbol(record.address, record.symbol);
                self.add_ordinal(record.address, record.ordinal);
                self.binds.push(Binding {
                    address: record.address,
                    symbol: record.symbol.into(),
                    ordinal: record.ordinal,
                    addend: record.addend,
                    stream: kind,
                });
            }
        }

        if info.export_size == 0 {
            return;
        }
        let export_off = ctx.origin() + u64::from(info.export_off);
        if ctx.file_offset_encrypted(export_off) {
            warn!("export trie lies in the encrypted range, skipping");
            return;
        }

        let trie = ctx.linkedit_bytes(u64::from(info.export_off), info.export_size as usize);
        let base = ctx.image_base();
        for export in ExportTrieWalker::new(trie)
            .with_max_depth(max_trie_depth)
            .walk()
        {
            let address = if export.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK
                == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE
            {
                export.address
            } else {
                base.wrapping_add(export.address)
            };
            self.insert_symbol(address, &export.name);
            self.mark_external(address);
            self.exports.push(Export {
                address,
                name: export.name.into_boxed_slice(),
                flags: export.flags,
            });
        }
    }

    fn collect_cstring_pools(&mut self, ctx: &MachOContext) {
        self.cstring_pools = ctx
            .sections()
            .iter()
            .filter(|s| s.is_cstring_literals() && !ctx.section_encrypted(s))
            .map(|s| CStringPool {
                addr: s.addr,
                size: s.size,
                file_offset: ctx.origin() + s.offset,
            })
            .collect();
    }

    // =========================================================================
    // Writers
    // =========================================================================

    /// Names `address` unless it already has a name.
    pub(crate) fn insert_symbol(&mut self, address: u64, name: &[u8]) {
        if let BTreeEntry::Vacant(slot) = self.symbols.entry(address) {
            slot.insert(name.into());
        }
    }

    /// Names `address`, replacing any earlier name.
    pub(crate) fn set_symbol(&mut self, address: u64, name: &[u8]) {
        self.symbols.insert(address, name.into());
    }

    /// Records a library ordinal unless one is already recorded.
    pub(crate) fn add_ordinal(&mut self, address: u64, ordinal: i32) {
        self.ordinals.entry(address).or_insert(ordinal);
    }

    pub(crate) fn mark_external(&mut self, address: u64) {
        self.external.insert(address);
    }

    pub(crate) fn set_cfstring(&mut self, address: u64, text: &[u8]) {
        self.cfstrings.insert(address, text.into());
    }

    pub(crate) fn set_class(&mut self, address: u64, name: &[u8]) {
        self.classes.insert(address, name.into());
    }

    pub(crate) fn set_selector(&mut self, address: u64, name: &[u8]) {
        self.selectors.insert(address, name.into());
    }

    pub(crate) fn set_protocol(&mut self, address: u64, name: &[u8]) {
        self.protocols.insert(address, name.into());
    }

    pub(crate) fn set_ivar(&mut self, address: u64, name: &[u8]) {
        self.ivars.insert(address, name.into());
    }

    pub(crate) fn add_method(&mut self, imp: u64, method: ObjCMethod) {
        self.methods.insert(imp, method);
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Symbol name at `address`.
    pub fn symbol(&self, address: u64) -> Option<&[u8]> {
        self.symbols.get(&address).map(|s| &**s)
    }

    /// Library ordinal recorded for `address`.
    pub fn ordinal(&self, address: u64) -> Option<i32> {
        self.ordinals.get(&address).copied()
    }

    /// Returns true if `address` is an external or exported symbol.
    pub fn is_external(&self, address: u64) -> bool {
        self.external.contains(&address)
    }

    /// CFString contents at `address`.
    pub fn cfstring(&self, address: u64) -> Option<&[u8]> {
        self.cfstrings.get(&address).map(|s| &**s)
    }

    /// Class name at `address`.
    pub fn class(&self, address: u64) -> Option<&[u8]> {
        self.classes.get(&address).map(|s| &**s)
    }

    /// Selector name at `address`.
    pub fn selector(&self, address: u64) -> Option<&[u8]> {
        self.selectors.get(&address).map(|s| &**s)
    }

    /// Protocol name at `address`.
    pub fn protocol(&self, address: u64) -> Option<&[u8]> {
        self.protocols.get(&address).map(|s| &**s)
    }

    /// Name of the ivar whose offset is stored at `address`.
    pub fn ivar(&self, address: u64) -> Option<&[u8]> {
        self.ivars.get(&address).map(|s| &**s)
    }

    /// Method implemented at `address`.
    pub fn method(&self, address: u64) -> Option<&ObjCMethod> {
        self.methods.get(&address)
    }

    /// The first symbol strictly after `address`.
    pub fn next_symbol_after(&self, address: u64) -> Option<(u64, &[u8])> {
        self.symbols
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()
            .map(|(addr, name)| (*addr, &**name))
    }

    /// Lowest address whose symbol name equals `name`.
    pub fn address_of_symbol(&self, name: &[u8]) -> Option<u64> {
        self.symbols
            .iter()
            .find(|(_, n)| &***n == name)
            .map(|(addr, _)| *addr)
    }

    /// The C-string pool containing `address`, with the file offset it maps to.
    pub fn cstring_pool_offset(&self, address: u64) -> Option<u64> {
        self.cstring_pools
            .iter()
            .find_map(|pool| pool.file_offset_of(address))
    }

    /// Bind records in decode order.
    pub fn binds(&self) -> &[Binding] {
        &self.binds
    }

    /// Exports in trie order.
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::bind_opcodes::*;
    use crate::macho::{ArchSelector, DyldInfoCommand, N_EXT, N_SECT, S_CSTRING_LITERALS};
    use crate::testutil::{nlist64, sect, strtab, ImageBuilder};

    fn dyld_image() -> Vec<u8> {
        let binds = vec![
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'_',
            b'p',
            b'u',
            b't',
            b's',
            0,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2,
            0x10,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
        ];
        // "_main" -> 0x800 (image relative)
        let trie = vec![
            0x00, 0x01, b'_', b'm', b'a', b'i', b'n', 0x00, 0x09, //
            0x03, 0x00, 0x80, 0x10, 0x00,
        ];
        let (strings, offs) = strtab(&["_main_local", "_puts_sym"]);
        let symbols = nlist64(&[
            (offs[0], N_SECT | N_EXT, 0, 0x1_0000_0800),
            (offs[1], N_SECT, 0, 0x1_0000_4010),
        ]);

        ImageBuilder::new64()
            .segment("__PAGEZERO", 0, 0x1_0000_0000, 0, 0, &[])
            .segment(
                "__TEXT",
                0x1_0000_0000,
                0x4000,
                0,
                0x4000,
                &[
                    sect("__text", "__TEXT", 0x1_0000_0800, 0x100, 0x800, 0),
                    sect("__cstring", "__TEXT", 0x1_0000_0900, 0x20, 0x900, S_CSTRING_LITERALS),
                ],
            )
            .segment(
                "__DATA",
                0x1_0000_4000,
                0x1000,
                0x4000,
                0x1000,
                &[sect("__got", "__DATA", 0x1_0000_4000, 0x20, 0x4000, 0)],
            )
            .dyld_info(0x5000, binds.len() as u32, 0x5100, trie.len() as u32)
            .symtab(0x5200, 2, 0x5300, strings.len() as u32)
            .place(0x900, b"hello\0world\0")
            .place(0x5000, &binds)
            .place(0x5100, &trie)
            .place(0x5200, &symbols)
            .place(0x5300, &strings)
            .build()
    }

    fn build(options: &LoadOptions) -> SymbolTables {
        let ctx = MachOContext::from_bytes(dyld_image(), ArchSelector::Any).unwrap();
        SymbolTables::build(&ctx, options)
    }

    #[test]
    fn test_binds_exports_and_symtab_order() {
        let tables = build(&LoadOptions::default());

        // the export is rebased and then overwritten by the symbol table
        assert_eq!(tables.symbol(0x1_0000_0800), Some(&b"_main_local"[..]));
        assert!(tables.is_external(0x1_0000_0800));
        assert_eq!(tables.exports()[0].address, 0x1_0000_0800);
        assert_eq!(&*tables.exports()[0].name, b"_main");

        // the bind is inserted first, then replaced by the symbol table entry,
        // but its ordinal survives
        assert_eq!(tables.symbol(0x1_0000_4010), Some(&b"_puts_sym"[..]));
        assert_eq!(tables.ordinal(0x1_0000_4010), Some(1));
        assert_eq!(tables.binds().len(), 1);
        assert_eq!(&*tables.binds()[0].symbol, b"_puts");
        assert_eq!(tables.binds()[0].stream, BindStreamKind::Eager);
    }

    #[test]
    fn test_skip_dyld_info() {
        let tables = build(&LoadOptions::default().with_skip_dyld_info(true));
        assert!(tables.binds().is_empty());
        assert!(tables.exports().is_empty());
        assert_eq!(tables.ordinal(0x1_0000_4010), None);
        assert!(tables.is_external(0x1_0000_0800));
    }

    #[test]
    fn test_nearest_and_reverse_lookup() {
        let tables = build(&LoadOptions::default());
        assert_eq!(
            tables.next_symbol_after(0x1_0000_0700),
            Some((0x1_0000_0800, &b"_main_local"[..]))
        );
        assert_eq!(
            tables.next_symbol_after(0x1_0000_0800),
            Some((0x1_0000_4010, &b"_puts_sym"[..]))
        );
        assert_eq!(tables.next_symbol_after(0x1_0000_4010), None);
        assert_eq!(tables.address_of_symbol(b"_puts_sym"), Some(0x1_0000_4010));
        assert_eq!(tables.address_of_symbol(b"_nothing"), None);
    }

    #[test]
    fn test_cstring_pool_is_half_open() {
        let tables = build(&LoadOptions::default());
        assert_eq!(tables.cstring_pool_offset(0x1_0000_0906), Some(0x906));
        assert_eq!(tables.cstring_pool_offset(0x1_0000_091f), Some(0x91f));
        assert_eq!(tables.cstring_pool_offset(0x1_0000_0920), None);
    }

    fn symbol_op(name: &str) -> Vec<u8> {
        let mut out = vec![BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM];
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out
    }

    /// Eager, weak and lazy binds plus an export, all naming `__DATA+0x8`.
    fn colliding_streams() -> ImageBuilder {
        let at_got = |offset: u8| vec![BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2, offset];

        let eager = [
            vec![BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1],
            symbol_op("_eager"),
            at_got(0x08),
            vec![BIND_OPCODE_DO_BIND, BIND_OPCODE_DONE],
        ]
        .concat();
        let weak = [
            vec![BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 2],
            symbol_op("_weak"),
            at_got(0x08),
            vec![BIND_OPCODE_DO_BIND, BIND_OPCODE_DONE],
        ]
        .concat();
        let lazy = [
            at_got(0x08),
            vec![BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 3],
            symbol_op("_lazy"),
            vec![BIND_OPCODE_DO_BIND, BIND_OPCODE_DONE],
            at_got(0x10),
            vec![BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 3],
            symbol_op("_lazy2"),
            vec![BIND_OPCODE_DO_BIND, BIND_OPCODE_DONE],
        ]
        .concat();
        // "_exp" -> 0x4008 (image relative)
        let trie = vec![
            0x00, 0x01, b'_', b'e', b'x', b'p', 0x00, 0x08, //
            0x04, 0x00, 0x88, 0x80, 0x01, 0x00,
        ];

        ImageBuilder::new64()
            .segment("__PAGEZERO", 0, 0x1_0000_0000, 0, 0, &[])
            .segment("__TEXT", 0x1_0000_0000, 0x4000, 0, 0x4000, &[])
            .segment(
                "__DATA",
                0x1_0000_4000,
                0x1000,
                0x4000,
                0x1000,
                &[sect("__got", "__DATA", 0x1_0000_4000, 0x20, 0x4000, 0)],
            )
            .dyld_info_full(DyldInfoCommand {
                bind_off: 0x5000,
                bind_size: eager.len() as u32,
                weak_bind_off: 0x5040,
                weak_bind_size: weak.len() as u32,
                lazy_bind_off: 0x5080,
                lazy_bind_size: lazy.len() as u32,
                export_off: 0x5100,
                export_size: trie.len() as u32,
                ..Default::default()
            })
            .place(0x5000, &eager)
            .place(0x5040, &weak)
            .place(0x5080, &lazy)
            .place(0x5100, &trie)
    }

    fn build_from(data: Vec<u8>) -> SymbolTables {
        let ctx = MachOContext::from_bytes(data, ArchSelector::Any).unwrap();
        SymbolTables::build(&ctx, &LoadOptions::default())
    }

    #[test]
    fn test_first_bind_or_export_wins() {
        let tables = build_from(colliding_streams().build());
        let slot = 0x1_0000_4008;

        assert_eq!(tables.symbol(slot), Some(&b"_eager"[..]));
        assert_eq!(tables.ordinal(slot), Some(1));
        assert!(tables.is_external(slot));

        let streams: Vec<_> = tables.binds().iter().map(|b| b.stream).collect();
        assert_eq!(
            streams,
            vec![
                BindStreamKind::Eager,
                BindStreamKind::Weak,
                BindStreamKind::Lazy,
                BindStreamKind::Lazy
            ]
        );
        // DONE only separates lazy entries
        assert_eq!(tables.symbol(0x1_0000_4010), Some(&b"_lazy2"[..]));
        assert_eq!(tables.ordinal(0x1_0000_4010), Some(3));

        assert_eq!(tables.exports().len(), 1);
        assert_eq!(tables.exports()[0].address, slot);
        assert_eq!(&*tables.exports()[0].name, b"_exp");
    }

    #[test]
    fn test_encrypted_export_trie_is_skipped() {
        crate::testutil::init_tracing();
        let data = colliding_streams().encryption(0x5100, 0x100, 1).build();
        let tables = build_from(data);
        assert!(tables.exports().is_empty());
        assert_eq!(tables.binds().len(), 4);
        assert!(!tables.is_external(0x1_0000_4008));
    }
}
