//! Export trie walking.
//!
//! The export trie is a compact prefix tree of exported symbol names. Each
//! node can contain:
//! - Terminal information (flags, address, optional resolver)
//! - Children edges (label prefix + offset to child node)
//!
//! Child offsets are relative to the start of the trie. Nothing stops a
//! malformed trie from pointing back at an ancestor, so the walker remembers
//! every node it has decoded and bounds its recursion depth.

use std::collections::HashSet;

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::macho::EXPORT_SYMBOL_FLAGS_REEXPORT;
use crate::reader::ByteReader;

/// Default recursion bound for [`ExportTrieWalker`].
pub const DEFAULT_MAX_TRIE_DEPTH: usize = 128;

/// An exported symbol decoded from the trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    /// Symbol name
    pub name: Vec<u8>,
    /// Export flags
    pub flags: u64,
    /// Raw trie value (relative to the image base)
    pub address: u64,
}

/// Walker for export tries.
pub struct ExportTrieWalker<'a> {
    data: &'a [u8],
    max_depth: usize,
}

struct WalkState {
    prefix: Vec<u8>,
    visited: HashSet<usize>,
    exports: Vec<ExportRecord>,
}

impl<'a> ExportTrieWalker<'a> {
    /// Creates a walker over the given export trie bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            max_depth: DEFAULT_MAX_TRIE_DEPTH,
        }
    }

    /// Sets the recursion bound.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Collects every export reachable from the root.
    ///
    /// Malformed branches are logged and abandoned; exports from the rest of
    /// the trie are still returned.
    pub fn walk(&self) -> Vec<ExportRecord> {
        let mut state = WalkState {
            prefix: Vec::new(),
            visited: HashSet::new(),
            exports: Vec::new(),
        };
        if !self.data.is_empty() {
            self.visit(0, 0, &mut state);
        }
        state.exports
    }

    fn visit(&self, offset: usize, depth: usize, state: &mut WalkState) {
        if depth > self.max_depth {
            warn!(
                "export trie deeper than {} at offset {:#x}, abandoning branch",
                self.max_depth, offset
            );
            return;
        }
        if !state.visited.insert(offset) {
            warn!("export trie revisits node at offset {:#x}, abandoning branch", offset);
            return;
        }
        if let Err(err) = self.parse_node(offset, depth, state) {
            warn!("malformed export trie node: {}", err);
        }
    }

    /// Decodes the node at `offset` and recurses into its children.
    fn parse_node(&self, offset: usize, depth: usize, state: &mut WalkState) -> Result<()> {
        if offset >= self.data.len() {
            return Err(Error::InvalidExportTrie {
                offset,
                reason: "node offset past end of trie",
            });
        }

        let mut reader = ByteReader::new(self.data);
        reader.seek(offset)?;

        let terminal_size = reader.read_uleb128()? as usize;
        let children_at = reader
            .position()
            .checked_add(terminal_size)
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::InvalidExportTrie {
                offset,
                reason: "terminal info past end of trie",
            })?;

        if terminal_size > 0 {
            let terminal = &self.data[reader.position()..children_at];
            self.parse_terminal(terminal, state)?;
        }

        reader.seek(children_at)?;
        if reader.at_end() {
            return Ok(());
        }

        let child_count = reader.read_u8()?;
        trace!(
            "trie node {:#x}: terminal {} bytes, {} children",
            offset,
            terminal_size,
            child_count
        );

        for _ in 0..child_count {
            let label = reader.read_cstr()?;
            let child = reader.read_uleb128()? as usize;

            let restore = state.prefix.len();
            state.prefix.extend_from_slice(label);
            self.visit(child, depth + 1, state);
            state.prefix.truncate(restore);
        }

        Ok(())
    }

    /// Parses terminal export info for the current prefix.
    fn parse_terminal(&self, terminal: &[u8], state: &mut WalkState) -> Result<()> {
        let mut reader = ByteReader::new(terminal);
        let flags = reader.read_uleb128()?;

        if (flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0 {
            trace!("skipping re-export {}", String::from_utf8_lossy(&state.prefix));
            return Ok(());
        }

        // Stub-and-resolver terminals list the stub first; the resolver
        // address that follows is not recorded.
        let address = reader.read_uleb128()?;
        state.exports.push(ExportRecord {
            name: state.prefix.clone(),
            flags,
            address,
        });
        Ok(())
    }
}
