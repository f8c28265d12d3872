//! machsym - Mach-O symbol and Objective-C metadata introspection.
//!
//! This library loads a thin or fat Mach-O image and builds address-keyed
//! lookup tables from its symbol table, dynamic-linker info, indirect symbol
//! sections and Objective-C runtime metadata. The tables answer "what is at
//! this address" for disassemblers and other analysis tools.
//!
//! # Features
//!
//! - Memory-mapped, read-only loading of thin and fat images
//! - File offset and virtual address translation with a caller-owned hint
//! - Bind opcode streams and the export trie
//! - Symbol table, external relocations and indirect symbol stubs
//! - ObjC classes, methods, selectors, protocols, ivars and `CFString`s
//! - Transitive dylib dependency closure
//!
//! Malformed input never panics: decoding problems are logged through
//! `tracing` and the affected table keeps what was decoded. Only a failure to
//! open the file or a missing fat architecture is reported as an error.
//!
//! # Example
//!
//! ```no_run
//! use machsym::{LoadOptions, MachOFile};
//!
//! fn main() -> machsym::Result<()> {
//!     let options = LoadOptions::default().with_arch("arm64");
//!     let image = MachOFile::open_with_options("/path/to/binary", &options)?;
//!
//!     if let Some(resolved) = image.string_representation(0x1_0000_4010) {
//!         println!("{resolved}");
//!     }
//!     for lib in image.linked_libraries_recursive() {
//!         println!("{lib}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dyld;
pub mod error;
pub mod format;
pub mod image;
pub mod index;
pub mod macho;
pub mod reader;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use error::{Error, Result};
pub use format::{decorate, escape, StringKind};
pub use image::{MachOFile, NearestMatch, Resolved, SymbolEntry};
pub use index::{Binding, Export, ObjCMethod, SymbolTables};
pub use macho::{ArchSelector, MachOContext, SectionHint};

use dyld::DEFAULT_MAX_TRIE_DEPTH;

/// Options for loading an image.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Architecture to select from a fat binary (`None` takes the first slice)
    pub arch: Option<String>,
    /// Skip bind and export decoding
    pub skip_dyld_info: bool,
    /// Skip the ObjC and CFString scanner
    pub skip_objc: bool,
    /// Recursion bound for the export trie
    pub max_trie_depth: usize,
    /// Prefix for absolute dylib paths in `linked_libraries*`
    pub sysroot: String,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            arch: None,
            skip_dyld_info: false,
            skip_objc: false,
            max_trie_depth: DEFAULT_MAX_TRIE_DEPTH,
            sysroot: String::new(),
        }
    }
}

impl LoadOptions {
    /// Selects a fat architecture by name (e.g. `"armv7"`, `"arm64"`).
    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    /// Enables or disables bind and export decoding.
    pub fn with_skip_dyld_info(mut self, skip: bool) -> Self {
        self.skip_dyld_info = skip;
        self
    }

    /// Enables or disables the ObjC scanner.
    pub fn with_skip_objc(mut self, skip: bool) -> Self {
        self.skip_objc = skip;
        self
    }

    /// Sets the export trie recursion bound.
    pub fn with_max_trie_depth(mut self, depth: usize) -> Self {
        self.max_trie_depth = depth;
        self
    }

    /// Sets the sysroot used to locate dependent libraries.
    pub fn with_sysroot(mut self, sysroot: impl Into<String>) -> Self {
        self.sysroot = sysroot.into();
        self
    }

    /// The fat slice selector named by `arch`.
    ///
    /// Unknown names fall back to the first slice with a warning.
    pub fn selector(&self) -> ArchSelector {
        ArchSelector::resolve(self.arch.as_deref())
    }
}
