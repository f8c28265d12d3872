//! Loaded images and address queries.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::format::{write_escaped, StringKind};
use crate::index::{Binding, Export, ObjCMethod, SymbolTables};
use crate::macho::{MachOContext, ADDRESS_MODE_BIT};
use crate::LoadOptions;

/// A string found for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<'a> {
    /// Raw bytes, without the terminating NUL
    pub text: &'a [u8],
    /// Table the string came from
    pub kind: StringKind,
}

impl Resolved<'_> {
    /// The text with invalid UTF-8 replaced.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.text)
    }
}

impl fmt::Display for Resolved<'_> {
    /// Renders the decorated, escaped form (e.g. `CFSTR("hello\n")`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.prefix())?;
        write_escaped(f, self.text)?;
        f.write_str(self.kind.suffix())
    }
}

/// The closest symbol at or after an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearestMatch<'a> {
    /// The string found
    pub resolved: Resolved<'a>,
    /// Distance from the queried address forward to the match
    pub offset: u64,
}

/// One entry produced by [`MachOFile::symbols`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry<'a> {
    /// Address the entry is keyed by
    pub address: u64,
    /// Name or string contents
    pub text: Cow<'a, [u8]>,
    /// Table the entry came from
    pub kind: StringKind,
}

/// A loaded Mach-O image with its lookup tables.
#[derive(Debug)]
pub struct MachOFile {
    ctx: MachOContext,
    tables: SymbolTables,
    options: LoadOptions,
}

impl MachOFile {
    /// Opens an image with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, &LoadOptions::default())
    }

    /// Opens an image.
    ///
    /// Fails only when the file cannot be opened or mapped, or when the
    /// requested architecture is missing from a fat binary.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<Self> {
        let ctx = MachOContext::open(path, options.selector())?;
        Ok(Self::index(ctx, options))
    }

    /// Loads an image from memory.
    pub fn from_bytes(data: Vec<u8>, options: &LoadOptions) -> Result<Self> {
        let ctx = MachOContext::from_bytes(data, options.selector())?;
        Ok(Self::index(ctx, options))
    }

    fn index(ctx: MachOContext, options: &LoadOptions) -> Self {
        let tables = SymbolTables::build(&ctx, options);
        Self {
            ctx,
            tables,
            options: options.clone(),
        }
    }

    /// The parsed container.
    #[inline]
    pub fn context(&self) -> &MachOContext {
        &self.ctx
    }

    /// The lookup tables.
    #[inline]
    pub fn tables(&self) -> &SymbolTables {
        &self.tables
    }

    /// Returns true if the image had a recognized Mach-O magic.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.ctx.is_valid()
    }

    // =========================================================================
    // String Queries
    // =========================================================================

    /// Finds a string for `vm_address`.
    ///
    /// Tables are tried in order: CFString, symbol, class, selector, protocol,
    /// ivar, then the C-string literal sections. For an invalid image the
    /// address is read as a raw file offset. Address 0 never resolves.
    pub fn string_representation(&self, vm_address: u64) -> Option<Resolved<'_>> {
        if vm_address == 0 {
            return None;
        }
        if !self.ctx.is_valid() {
            return self.raw_cstring(vm_address);
        }

        let t = &self.tables;
        let lookups: [(Option<&[u8]>, StringKind); 6] = [
            (t.cfstring(vm_address), StringKind::CFString),
            (t.symbol(vm_address), StringKind::Symbol),
            (t.class(vm_address), StringKind::ObjCClass),
            (t.selector(vm_address), StringKind::ObjCSelector),
            (t.protocol(vm_address), StringKind::ObjCProtocol),
            (t.ivar(vm_address), StringKind::ObjCIvar),
        ];
        if let Some(found) = lookups
            .into_iter()
            .find_map(|(text, kind)| text.map(|text| Resolved { text, kind }))
        {
            return Some(found);
        }

        self.pooled_cstring(vm_address)
    }

    /// Finds the first symbol strictly after `vm_address` and its distance.
    ///
    /// Falls back to the C-string literal sections (distance 0) when no symbol
    /// lies above the address.
    pub fn nearest_string_representation(&self, vm_address: u64) -> Option<NearestMatch<'_>> {
        if !self.ctx.is_valid() {
            return self.raw_cstring(vm_address).map(|resolved| NearestMatch {
                resolved,
                offset: 0,
            });
        }

        if let Some((address, text)) = self.tables.next_symbol_after(vm_address) {
            return Some(NearestMatch {
                resolved: Resolved {
                    text,
                    kind: StringKind::Symbol,
                },
                offset: address - vm_address,
            });
        }

        self.pooled_cstring(vm_address)
            .map(|resolved| NearestMatch { resolved, offset: 0 })
    }

    fn raw_cstring(&self, offset: u64) -> Option<Resolved<'_>> {
        self.ctx.cstr_at(offset).map(|text| Resolved {
            text,
            kind: StringKind::CString,
        })
    }

    fn pooled_cstring(&self, vm_address: u64) -> Option<Resolved<'_>> {
        let offset = self.tables.cstring_pool_offset(vm_address)?;
        self.raw_cstring(offset)
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    /// The ObjC method implemented at `vm_address`.
    pub fn objc_method_at_vm_address(&self, vm_address: u64) -> Option<&ObjCMethod> {
        if !self.ctx.is_valid() {
            return None;
        }
        self.tables.method(vm_address & !ADDRESS_MODE_BIT)
    }

    /// The install name of the library a bound or imported symbol comes from.
    ///
    /// Ordinal 0 (this image) and the special negative ordinals have no
    /// library.
    pub fn library_of_relocated_symbol(&self, vm_address: u64) -> Option<&str> {
        let ordinal = self.tables.ordinal(vm_address & !ADDRESS_MODE_BIT)?;
        let index = usize::try_from(ordinal).ok()?.checked_sub(1)?;
        self.ctx.dependent_dylibs().nth(index)
    }

    /// Lowest address whose symbol name is `name`.
    pub fn address_of_symbol(&self, name: impl AsRef<[u8]>) -> Option<u64> {
        self.tables.address_of_symbol(name.as_ref())
    }

    /// Returns true if `vm_address` holds an external or exported symbol.
    pub fn is_external(&self, vm_address: u64) -> bool {
        self.tables.is_external(vm_address)
    }

    /// ObjC methods by implementation address.
    pub fn objc_methods(&self) -> impl Iterator<Item = (u64, &ObjCMethod)> {
        self.tables.methods.iter().map(|(addr, method)| (*addr, method))
    }

    /// Exports, rebased to the image.
    pub fn exports(&self) -> &[Export] {
        self.tables.exports()
    }

    /// Bind records from every stream.
    pub fn binds(&self) -> &[Binding] {
        self.tables.binds()
    }

    /// Every table entry: symbols, CFStrings, classes, selectors, protocols,
    /// ivars, then methods rendered as `-[Class selector]`.
    ///
    /// Each call starts a fresh pass.
    pub fn symbols(&self) -> impl Iterator<Item = SymbolEntry<'_>> {
        let t = &self.tables;
        let symbols = t.symbols.iter().map(|(address, text)| SymbolEntry {
            address: *address,
            text: Cow::Borrowed(&**text),
            kind: StringKind::Symbol,
        });
        let methods = t.methods.iter().map(|(address, method)| SymbolEntry {
            address: *address,
            text: Cow::Owned(method.signature()),
            kind: StringKind::ObjCMethod,
        });

        symbols
            .chain(table_entries(&t.cfstrings, StringKind::CFString))
            .chain(table_entries(&t.classes, StringKind::ObjCClass))
            .chain(table_entries(&t.selectors, StringKind::ObjCSelector))
            .chain(table_entries(&t.protocols, StringKind::ObjCProtocol))
            .chain(table_entries(&t.ivars, StringKind::ObjCIvar))
            .chain(methods)
    }

    // =========================================================================
    // Dependencies
    // =========================================================================

    /// Paths of the libraries this image links against.
    ///
    /// `@rpath/`-style names keep the part after the first `/`; absolute names
    /// are prefixed with the sysroot.
    pub fn linked_libraries(&self) -> Vec<String> {
        linked_library_paths(&self.ctx, &self.options.sysroot)
    }

    /// The transitive closure of [`linked_libraries`](Self::linked_libraries),
    /// in discovery order.
    ///
    /// Every path appears once, and the image itself never appears, so
    /// dependency cycles terminate. Libraries that cannot be opened are listed
    /// but not followed.
    pub fn linked_libraries_recursive(&self) -> Vec<String> {
        let sysroot = &self.options.sysroot;
        let selector = self.options.selector();

        let mut seen: HashSet<String> = HashSet::new();
        if let Some(path) = self.ctx.path() {
            seen.insert(path.to_string_lossy().into_owned());
        }
        if let Some(id) = self.ctx.self_path() {
            if let Some(path) = library_path(id, sysroot) {
                seen.insert(path);
            }
        }

        let mut found = Vec::new();
        let mut pending = VecDeque::new();
        for lib in self.linked_libraries() {
            if seen.insert(lib.clone()) {
                found.push(lib.clone());
                pending.push_back(lib);
            }
        }

        while let Some(lib) = pending.pop_front() {
            let ctx = match MachOContext::open(&lib, selector) {
                Ok(ctx) => ctx,
                Err(e) => {
                    debug!("not following {}: {}", lib, e);
                    continue;
                }
            };
            for dep in linked_library_paths(&ctx, sysroot) {
                if seen.insert(dep.clone()) {
                    found.push(dep.clone());
                    pending.push_back(dep);
                }
            }
        }

        debug!("{} libraries in dependency closure", found.len());
        found
    }
}

fn table_entries(
    table: &HashMap<u64, Box<[u8]>>,
    kind: StringKind,
) -> impl Iterator<Item = SymbolEntry<'_>> {
    table.iter().map(move |(address, text)| SymbolEntry {
        address: *address,
        text: Cow::Borrowed(&**text),
        kind,
    })
}

fn linked_library_paths(ctx: &MachOContext, sysroot: &str) -> Vec<String> {
    if !ctx.is_valid() {
        return Vec::new();
    }
    ctx.dependent_dylibs()
        .filter_map(|name| library_path(name, sysroot))
        .collect()
}

fn library_path(name: &str, sysroot: &str) -> Option<String> {
    if name.starts_with('@') {
        name.split_once('/').map(|(_, rest)| rest.to_string())
    } else {
        Some(format!("{sysroot}{name}"))
    }
}
