//! Rendering of resolved strings.

use std::fmt;

/// What kind of table a resolved string came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringKind {
    /// Plain C-string literal
    CString,
    /// `CFString` constant
    CFString,
    /// Linker symbol
    Symbol,
    /// Objective-C class name
    ObjCClass,
    /// Objective-C selector
    ObjCSelector,
    /// Objective-C protocol
    ObjCProtocol,
    /// Objective-C instance variable
    ObjCIvar,
    /// Objective-C method signature
    ObjCMethod,
}

impl StringKind {
    /// Text printed before the escaped string.
    pub const fn prefix(self) -> &'static str {
        match self {
            StringKind::CString => "\"",
            StringKind::CFString => "CFSTR(\"",
            StringKind::ObjCSelector => "@selector(",
            StringKind::ObjCProtocol => "@protocol(",
            StringKind::Symbol
            | StringKind::ObjCClass
            | StringKind::ObjCIvar
            | StringKind::ObjCMethod => "",
        }
    }

    /// Text printed after the escaped string.
    pub const fn suffix(self) -> &'static str {
        match self {
            StringKind::CString => "\"",
            StringKind::CFString => "\")",
            StringKind::ObjCSelector | StringKind::ObjCProtocol => ")",
            StringKind::Symbol
            | StringKind::ObjCClass
            | StringKind::ObjCIvar
            | StringKind::ObjCMethod => "",
        }
    }
}

impl fmt::Display for StringKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StringKind::CString => "cstring",
            StringKind::CFString => "cfstring",
            StringKind::Symbol => "symbol",
            StringKind::ObjCClass => "class",
            StringKind::ObjCSelector => "selector",
            StringKind::ObjCProtocol => "protocol",
            StringKind::ObjCIvar => "ivar",
            StringKind::ObjCMethod => "method",
        };
        f.write_str(name)
    }
}

/// Writes `bytes` with C escapes for control and non-ASCII bytes.
pub fn write_escaped<W: fmt::Write>(out: &mut W, bytes: &[u8]) -> fmt::Result {
    for &b in bytes {
        match b {
            b'\t' => out.write_str("\\t")?,
            b'\n' => out.write_str("\\n")?,
            b'\\' => out.write_str("\\\\")?,
            b'"' => out.write_str("\\\"")?,
            0x07 => out.write_str("\\a")?,
            0x08 => out.write_str("\\b")?,
            0x0c => out.write_str("\\f")?,
            b'\r' => out.write_str("\\r")?,
            0x0b => out.write_str("\\v")?,
            b' '..=b'~' => out.write_char(char::from(b))?,
            _ => write!(out, "\\x{:02x}", b)?,
        }
    }
    Ok(())
}

/// Returns `bytes` escaped.
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    // Writing to a String cannot fail.
    let _ = write_escaped(&mut out, bytes);
    out
}

/// Returns `bytes` escaped and wrapped in the decoration for `kind`.
pub fn decorate(bytes: &[u8], kind: StringKind) -> String {
    let mut out = String::with_capacity(bytes.len() + 10);
    out.push_str(kind.prefix());
    let _ = write_escaped(&mut out, bytes);
    out.push_str(kind.suffix());
    out
}
