//! Objective-C metadata and constant string scanning.
//!
//! Sections are recognized by name. Pointer-list sections (`__objc_classlist`,
//! `__objc_selrefs`, `__objc_protolist`) are read straight from the file; the
//! structures they point to are reached through the address translator.
//!
//! Layouts used (`P` = pointer width):
//!
//! | Structure | Field | Offset |
//! |---|---|---|
//! | CFString | info / data / length | `P`, `2P`, `3P` |
//! | class | isa / data | `0`, `4P` |
//! | class_ro | flags / name / baseMethods / ivars | `0`, `8+2P`, `8+3P`, `8+5P` |
//! | method_list | entsize+flags / count / first entry | `0`, `4`, `8` |
//! | ivar_list | entsize / count / first entry | `0`, `4`, `8` |
//! | protocol | name | `P` |

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, trace};

use super::SymbolTables;
use crate::macho::*;
use crate::util::{read_ptr_le_at, read_u16_le_at};

/// An Objective-C method implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjCMethod {
    /// Name of the implementing class
    pub class_name: Box<[u8]>,
    /// Selector name
    pub selector: Box<[u8]>,
    /// Type encoding
    pub types: Box<[u8]>,
    /// True for class (`+`) methods
    pub is_class_method: bool,
}

impl ObjCMethod {
    /// Renders the method as `+[Class selector]` or `-[Class selector]`.
    pub fn signature(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.class_name.len() + self.selector.len() + 4);
        out.extend_from_slice(if self.is_class_method { b"+[" } else { b"-[" });
        out.extend_from_slice(&self.class_name);
        out.push(b' ');
        out.extend_from_slice(&self.selector);
        out.push(b']');
        out
    }
}

impl fmt::Display for ObjCMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.signature()))
    }
}

/// Walks ObjC and CFString sections of one image.
struct ObjCScanner<'a> {
    ctx: &'a MachOContext,
    ptr: u64,
    data_hint: SectionHint,
    text_hint: SectionHint,
    visited_classes: HashSet<u64>,
}

/// Scans every recognized section of `ctx` into `tables`.
pub(crate) fn scan(ctx: &MachOContext, tables: &mut SymbolTables) {
    let mut scanner = ObjCScanner {
        ctx,
        ptr: ctx.pointer_width() as u64,
        data_hint: SectionHint::new(),
        text_hint: SectionHint::new(),
        visited_classes: HashSet::new(),
    };

    for section in ctx.sections() {
        let recognized = matches!(
            section.name.as_str(),
            "__cfstring" | "__class_list" | "__objc_classlist" | "__objc_selrefs" | "__objc_protolist"
        );
        if !recognized || section.is_zerofill() {
            continue;
        }
        if ctx.section_encrypted(section) {
            debug!("skipping encrypted section {}", section.full_name());
            continue;
        }
        match section.name.as_str() {
            "__cfstring" => scanner.scan_cfstrings(section, tables),
            "__objc_selrefs" => scanner.scan_selector_refs(section, tables),
            "__objc_protolist" => scanner.scan_protocol_list(section, tables),
            _ => scanner.scan_class_list(section, tables),
        }
    }

    debug!(
        "objc: {} cfstrings, {} classes, {} selectors, {} protocols, {} ivars, {} methods",
        tables.cfstrings.len(),
        tables.classes.len(),
        tables.selectors.len(),
        tables.protocols.len(),
        tables.ivars.len(),
        tables.methods.len()
    );
}

impl<'a> ObjCScanner<'a> {
    /// File bytes of a section.
    fn section_bytes(&self, section: &Section) -> &'a [u8] {
        let ctx: &'a MachOContext = self.ctx;
        ctx.bytes_at(ctx.origin() + section.offset, section.size as usize)
            .unwrap_or_default()
    }

    /// Pointer values stored in a pointer-list section.
    fn pointer_list(&self, section: &Section) -> impl Iterator<Item = u64> + 'a {
        let width = self.ptr as usize;
        self.section_bytes(section)
            .chunks_exact(width)
            .filter_map(move |raw| read_ptr_le_at(raw, 0, width))
    }

    /// `base + offset`, or `None` when a pointer from the image overflows.
    #[inline]
    fn field(&self, base: u64, offset: u64) -> Option<u64> {
        base.checked_add(offset)
    }

    #[inline]
    fn read_ptr(&mut self, addr: u64) -> Option<u64> {
        self.ctx.read_ptr_at_vm(addr, Some(&mut self.data_hint))
    }

    #[inline]
    fn read_u32(&mut self, addr: u64) -> Option<u32> {
        self.ctx.read_u32_at_vm(addr, Some(&mut self.data_hint))
    }

    #[inline]
    fn read_i32(&mut self, addr: u64) -> Option<i32> {
        self.read_u32(addr).map(|v| v as i32)
    }

    #[inline]
    fn string(&mut self, addr: u64) -> Option<&'a [u8]> {
        let ctx: &'a MachOContext = self.ctx;
        ctx.cstr_at_vm(addr, Some(&mut self.text_hint))
    }

    // =========================================================================
    // CFStrings
    // =========================================================================

    fn scan_cfstrings(&mut self, section: &Section, tables: &mut SymbolTables) {
        let width = self.ptr as usize;
        let record_size = 4 * width;
        let bytes = self.section_bytes(section);

        for (i, record) in bytes.chunks_exact(record_size).enumerate() {
            let Some(address) = self.field(section.addr, (i * record_size) as u64) else {
                break;
            };
            let (Some(info), Some(data), Some(length)) = (
                read_ptr_le_at(record, width, width),
                read_ptr_le_at(record, 2 * width, width),
                read_ptr_le_at(record, 3 * width, width),
            ) else {
                continue;
            };

            let text = if info & CFSTRING_INFO_UTF16 != 0 {
                self.utf16_string(data, length)
            } else {
                self.string(data).map(<[u8]>::to_vec)
            };

            match text {
                Some(text) => tables.set_cfstring(address, &text),
                None => trace!("cfstring at {:#x} has unmapped data {:#x}", address, data),
            }
        }
    }

    /// Decodes `length` UTF-16 code units at `addr` into UTF-8.
    fn utf16_string(&mut self, addr: u64, length: u64) -> Option<Vec<u8>> {
        let byte_len = usize::try_from(length).ok()?.checked_mul(2)?;
        let ctx: &'a MachOContext = self.ctx;
        let raw = ctx.bytes_at_vm(addr, byte_len, Some(&mut self.text_hint))?;
        let units = (0..raw.len())
            .step_by(2)
            .filter_map(|i| read_u16_le_at(raw, i));
        let decoded: String = char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        Some(decoded.into_bytes())
    }

    // =========================================================================
    // Selectors and Protocols
    // =========================================================================

    fn scan_selector_refs(&mut self, section: &Section, tables: &mut SymbolTables) {
        for selector in self.pointer_list(section) {
            if let Some(name) = self.string(selector) {
                tables.set_selector(selector, name);
            }
        }
    }

    fn scan_protocol_list(&mut self, section: &Section, tables: &mut SymbolTables) {
        for protocol in self.pointer_list(section) {
            let Some(name_ptr) = self
                .field(protocol, self.ptr)
                .and_then(|field| self.read_ptr(field))
            else {
                continue;
            };
            if let Some(name) = self.string(name_ptr) {
                tables.set_protocol(protocol, name);
            }
        }
    }

    // =========================================================================
    // Classes
    // =========================================================================

    fn scan_class_list(&mut self, section: &Section, tables: &mut SymbolTables) {
        for class in self.pointer_list(section) {
            self.scan_class(class, tables);
        }
    }

    /// Indexes a class and then its metaclass.
    fn scan_class(&mut self, class: u64, tables: &mut SymbolTables) {
        let mut current = class;
        for step in 0..2 {
            if current == 0 || !self.visited_classes.insert(current) {
                break;
            }
            let Some(ro) = self.class_ro(current) else {
                trace!("class at {:#x} has no readable data", current);
                break;
            };
            let Some(flags) = self.read_u32(ro) else {
                break;
            };
            let Some(name) = self
                .field(ro, 8 + 2 * self.ptr)
                .and_then(|field| self.read_ptr(field))
                .and_then(|p| self.string(p))
            else {
                break;
            };

            let is_meta = flags & RO_META != 0;
            if step == 0 {
                tables.set_class(class, name);
            }

            let methods = self
                .field(ro, 8 + 3 * self.ptr)
                .and_then(|field| self.read_ptr(field));
            if let Some(methods) = methods {
                self.scan_method_list(methods, name, is_meta, tables);
            }
            if !is_meta {
                let ivars = self
                    .field(ro, 8 + 5 * self.ptr)
                    .and_then(|field| self.read_ptr(field));
                if let Some(ivars) = ivars {
                    self.scan_ivar_list(ivars, tables);
                }
            }

            match self.read_ptr(current) {
                Some(isa) => current = isa,
                None => break,
            }
        }
    }

    /// Returns the address of a class's read-only data.
    fn class_ro(&mut self, class: u64) -> Option<u64> {
        let data = self.read_ptr(self.field(class, 4 * self.ptr)?)?;
        // Low bits of the data pointer carry runtime flags.
        let mask = if self.ptr == 8 { !7 } else { !3 };
        match data & mask {
            0 => None,
            ro => Some(ro),
        }
    }

    fn scan_method_list(
        &mut self,
        list: u64,
        class_name: &[u8],
        is_class_method: bool,
        tables: &mut SymbolTables,
    ) {
        if list == 0 {
            return;
        }
        let Some(count_field) = self.field(list, 4) else {
            return;
        };
        let (Some(header), Some(count)) = (self.read_u32(list), self.read_u32(count_field)) else {
            return;
        };
        let entsize = u64::from(header & METHOD_LIST_ENTSIZE_MASK);
        let relative = header & METHOD_LIST_RELATIVE_FLAG != 0;
        let direct_selectors = header & METHOD_LIST_SELECTORS_DIRECT_FLAG != 0;
        if entsize == 0 {
            return;
        }

        for j in 0..u64::from(count) {
            let Some(entry) = self.field(list, 8 + j * entsize) else {
                break;
            };
            let method = if relative {
                self.relative_method(entry, direct_selectors)
            } else {
                self.pointer_method(entry)
            };
            let Some((selector, types, imp)) = method else {
                break;
            };
            if imp == 0 {
                continue;
            }
            tables.add_method(
                imp & !ADDRESS_MODE_BIT,
                ObjCMethod {
                    class_name: class_name.into(),
                    selector: selector.into(),
                    types: types.unwrap_or_default().into(),
                    is_class_method,
                },
            );
        }
    }

    /// `{ SEL name; const char *types; IMP imp; }`
    fn pointer_method(&mut self, entry: u64) -> Option<(&'a [u8], Option<&'a [u8]>, u64)> {
        let selector_ptr = self.read_ptr(entry)?;
        let types_ptr = self.read_ptr(self.field(entry, self.ptr)?)?;
        let imp = self.read_ptr(self.field(entry, 2 * self.ptr)?)?;
        let selector = self.string(selector_ptr)?;
        Some((selector, self.string(types_ptr), imp))
    }

    /// `{ int32 name; int32 types; int32 imp; }`, each relative to its own field.
    fn relative_method(
        &mut self,
        entry: u64,
        direct_selectors: bool,
    ) -> Option<(&'a [u8], Option<&'a [u8]>, u64)> {
        let types_at = self.field(entry, 4)?;
        let imp_at = self.field(entry, 8)?;
        let name_field = entry.wrapping_add_signed(i64::from(self.read_i32(entry)?));
        let types_field = types_at.wrapping_add_signed(i64::from(self.read_i32(types_at)?));
        let imp = imp_at.wrapping_add_signed(i64::from(self.read_i32(imp_at)?));

        let selector = if direct_selectors {
            self.string(name_field)?
        } else {
            let selref = self.read_ptr(name_field)?;
            self.string(selref)?
        };
        Some((selector, self.string(types_field), imp))
    }

    /// `{ int32 *offset; const char *name; const char *type; uint32 alignment; uint32 size; }`
    fn scan_ivar_list(&mut self, list: u64, tables: &mut SymbolTables) {
        if list == 0 {
            return;
        }
        let Some(count_field) = self.field(list, 4) else {
            return;
        };
        let (Some(entsize), Some(count)) = (self.read_u32(list), self.read_u32(count_field)) else {
            return;
        };
        let entsize = u64::from(entsize);
        if entsize < 2 * self.ptr {
            return;
        }

        for j in 0..u64::from(count) {
            let Some(entry) = self.field(list, 8 + j * entsize) else {
                break;
            };
            let Some(name_field) = self.field(entry, self.ptr) else {
                break;
            };
            let (Some(offset_slot), Some(name_ptr)) =
                (self.read_ptr(entry), self.read_ptr(name_field))
            else {
                break;
            };
            if offset_slot == 0 {
                continue;
            }
            if let Some(name) = self.string(name_ptr) {
                tables.set_ivar(offset_slot, name);
            }
        }
    }
}
