//! Bind opcode interpreter.
//!
//! The dyld info command points at three opcode streams (eager, weak and
//! lazy). Each byte is a 4-bit opcode and a 4-bit immediate; operands follow
//! as LEB128 values or C strings. Interpreting a stream yields one
//! [`BindRecord`] per bound pointer slot.

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::macho::bind_opcodes::*;
use crate::reader::ByteReader;

/// Upper bound on the repeat count of a single bind opcode.
const MAX_BIND_REPEAT: u64 = 1 << 20;

/// Which dyld-info bind stream is being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStreamKind {
    /// Regular (non-lazy) binds
    Eager,
    /// Weak binds
    Weak,
    /// Lazy binds, one `DONE`-terminated entry per stub
    Lazy,
}

impl BindStreamKind {
    /// `DONE` ends the whole stream except for lazy binds, where it only
    /// separates entries.
    #[inline]
    fn done_terminates(self) -> bool {
        !matches!(self, BindStreamKind::Lazy)
    }
}

/// A pointer slot bound to an imported symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRecord<'a> {
    /// Virtual address of the slot
    pub address: u64,
    /// Imported symbol name
    pub symbol: &'a [u8],
    /// Library ordinal (0 = self, negative = special lookup)
    pub ordinal: i32,
    /// Addend in effect when the bind was issued. Not applied to `address`.
    pub addend: i64,
}

/// Interpreter state for a single stream.
struct BindState<'a> {
    ordinal: i32,
    symbol: &'a [u8],
    address: Option<u64>,
    addend: i64,
}

/// Decodes bind opcode streams against an image's segment layout.
#[derive(Debug, Clone)]
pub struct BindInterpreter<'s> {
    segment_bases: &'s [u64],
    pointer_width: u64,
}

impl<'s> BindInterpreter<'s> {
    /// Creates an interpreter. `segment_bases[i]` is the vmaddr of segment `i`.
    pub fn new(segment_bases: &'s [u64], pointer_width: usize) -> Self {
        Self {
            segment_bases,
            pointer_width: pointer_width as u64,
        }
    }

    /// Decodes one stream.
    ///
    /// Never fails: a truncated operand ends the stream with a warning and the
    /// records decoded up to that point are returned.
    pub fn run<'a>(&self, data: &'a [u8], kind: BindStreamKind) -> Vec<BindRecord<'a>> {
        let mut records = Vec::new();
        if let Err(err) = self.decode(data, kind, &mut records) {
            warn!(
                "{:?} bind stream truncated after {} records: {}",
                kind,
                records.len(),
                err
            );
        }
        records
    }

    fn decode<'a>(
        &self,
        data: &'a [u8],
        kind: BindStreamKind,
        records: &mut Vec<BindRecord<'a>>,
    ) -> Result<()> {
        let mut reader = ByteReader::new(data);
        let mut state = BindState {
            ordinal: 0,
            symbol: &[],
            address: None,
            addend: 0,
        };
        let ptr = self.pointer_width;

        while !reader.at_end() {
            let byte = reader.read_u8()?;
            let opcode = byte & BIND_OPCODE_MASK;
            let immediate = byte & BIND_IMMEDIATE_MASK;

            match opcode {
                BIND_OPCODE_DONE => {
                    trace!("bind: done");
                    if kind.done_terminates() {
                        break;
                    }
                }

                BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                    state.ordinal = i32::from(immediate);
                }

                BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                    state.ordinal = reader.read_uleb128()? as i32;
                }

                BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                    state.ordinal = if immediate == 0 {
                        0
                    } else {
                        i32::from((BIND_OPCODE_MASK | immediate) as i8)
                    };
                }

                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                    state.symbol = reader.read_cstr()?;
                    trace!("bind: symbol {}", String::from_utf8_lossy(state.symbol));
                }

                BIND_OPCODE_SET_TYPE_IMM => {}

                BIND_OPCODE_SET_ADDEND_SLEB => {
                    state.addend = reader.read_sleb128()?;
                }

                BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    let offset = reader.read_uleb128()?;
                    state.address = match self.segment_bases.get(usize::from(immediate)) {
                        Some(base) => Some(base.wrapping_add(offset)),
                        None => {
                            warn!("bind references missing segment {}", immediate);
                            None
                        }
                    };
                }

                BIND_OPCODE_ADD_ADDR_ULEB => {
                    let delta = reader.read_uleb128()?;
                    state.address = state.address.map(|a| a.wrapping_add(delta));
                }

                BIND_OPCODE_DO_BIND => {
                    self.emit(&state, records);
                    state.address = state.address.map(|a| a.wrapping_add(ptr));
                }

                BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                    self.emit(&state, records);
                    let delta = reader.read_uleb128()?;
                    state.address = state
                        .address
                        .map(|a| a.wrapping_add(ptr).wrapping_add(delta));
                }

                BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                    self.emit(&state, records);
                    let delta = (u64::from(immediate) + 1) * ptr;
                    state.address = state.address.map(|a| a.wrapping_add(delta));
                }

                BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = reader.read_uleb128()?;
                    let skip = reader.read_uleb128()?;
                    if count > MAX_BIND_REPEAT {
                        return Err(Error::parse(
                            reader.position(),
                            format!("bind repeat count {count} is implausible"),
                        ));
                    }
                    for _ in 0..count {
                        if state.address.is_none() {
                            break;
                        }
                        self.emit(&state, records);
                        state.address = state
                            .address
                            .map(|a| a.wrapping_add(skip).wrapping_add(ptr));
                    }
                }

                BIND_OPCODE_THREADED => {
                    if immediate == BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB {
                        reader.read_uleb128()?;
                    }
                }

                _ => {
                    trace!("bind: ignoring opcode {:#04x}", byte);
                }
            }
        }

        Ok(())
    }

    #[inline]
    fn emit<'a>(&self, state: &BindState<'a>, records: &mut Vec<BindRecord<'a>>) {
        if let Some(address) = state.address {
            records.push(BindRecord {
                address,
                symbol: state.symbol,
                ordinal: state.ordinal,
                addend: state.addend,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASES: &[u64] = &[0x1000, 0x4000];

    #[test]
    fn test_bind_then_bind_add_addr() {
        let stream = [
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 2,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'f',
            b'o',
            b'o',
            0,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x80,
            0x02,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB,
            0x08,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
        ];
        let records = BindInterpreter::new(BASES, 8).run(&stream, BindStreamKind::Eager);
        let addrs: Vec<_> = records.iter().map(|r| r.address).collect();
        assert_eq!(addrs, vec![0x1100, 0x1108, 0x1118]);
        assert!(records.iter().all(|r| r.symbol == b"foo" && r.ordinal == 2));
    }

    #[test]
    fn test_scaled_and_repeated_binds() {
        let stream = [
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'_',
            b'x',
            0,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x10,
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED | 2,
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB,
            3,
            4,
            BIND_OPCODE_ADD_ADDR_ULEB,
            0x20,
            BIND_OPCODE_DO_BIND,
        ];
        let records = BindInterpreter::new(BASES, 4).run(&stream, BindStreamKind::Eager);
        let addrs: Vec<_> = records.iter().map(|r| r.address).collect();
        // 0x4010, +3*4 -> 0x401c, three binds stepping 8, +0x20
        assert_eq!(addrs, vec![0x4010, 0x401c, 0x4024, 0x402c, 0x4054]);
    }

    #[test]
    fn test_special_ordinal_and_addend() {
        let stream = [
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | 0x0E,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'a',
            0,
            BIND_OPCODE_SET_ADDEND_SLEB,
            0x7C,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x00,
            BIND_OPCODE_DO_BIND,
        ];
        let records = BindInterpreter::new(BASES, 8).run(&stream, BindStreamKind::Weak);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ordinal, -2);
        assert_eq!(records[0].addend, -4);
        assert_eq!(records[0].address, 0x1000);
    }

    #[test]
    fn test_done_only_separates_lazy_entries() {
        let stream = [
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x00,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'a',
            0,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x08,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'b',
            0,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
        ];
        let interp = BindInterpreter::new(BASES, 8);
        assert_eq!(interp.run(&stream, BindStreamKind::Eager).len(), 1);

        let lazy = interp.run(&stream, BindStreamKind::Lazy);
        assert_eq!(lazy.len(), 2);
        assert_eq!(lazy[1].symbol, b"b");
        assert_eq!(lazy[1].address, 0x1008);
    }

    #[test]
    fn test_missing_segment_skips_binds() {
        let stream = [
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'a',
            0,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 9,
            0x00,
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB,
            0x10,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x00,
            BIND_OPCODE_DO_BIND,
        ];
        let records = BindInterpreter::new(BASES, 8).run(&stream, BindStreamKind::Eager);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, 0x1000);
    }

    #[test]
    fn test_truncated_stream_keeps_partial_records() {
        let stream = [
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'a',
            0,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x00,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_ADD_ADDR_ULEB,
            0x80,
        ];
        let records = BindInterpreter::new(BASES, 8).run(&stream, BindStreamKind::Eager);
        assert_eq!(records.len(), 1);

        let unterminated = [BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM, b'a', b'b'];
        assert!(BindInterpreter::new(BASES, 8)
            .run(&unterminated, BindStreamKind::Eager)
            .is_empty());
    }

    #[test]
    fn test_threaded_and_unknown_opcodes() {
        let stream = [
            BIND_OPCODE_THREADED | BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB,
            0x81,
            0x01,
            0xE0,
            0xF3,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'z',
            0,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x04,
            BIND_OPCODE_DO_BIND,
        ];
        let records = BindInterpreter::new(BASES, 8).run(&stream, BindStreamKind::Eager);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].symbol, b"z");
        assert_eq!(records[0].address, 0x1004);
    }
}
