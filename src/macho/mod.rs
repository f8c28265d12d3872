//! Mach-O file format handling.
//!
//! This module covers the on-disk structures of thin and fat Mach-O images,
//! architecture selection, and the loaded [`MachOContext`] that every index
//! builder reads through.

mod arch;
mod constants;
mod context;
mod structs;

pub use arch::*;
pub use constants::*;
pub use context::*;
pub use structs::*;
