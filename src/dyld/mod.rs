//! Dyld info decoding.
//!
//! Images linked for dyld describe their imports and exports in compressed
//! LINKEDIT streams referenced by `LC_DYLD_INFO(_ONLY)`:
//! - Bind opcode streams (eager, weak, lazy) naming the symbol bound to each
//!   pointer slot
//! - An export trie mapping exported names to image-relative addresses

pub mod bind;
pub mod trie;

pub use bind::*;
pub use trie::*;
