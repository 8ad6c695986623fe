//! Source positions for compiler diagnostics.

use std::fmt::{Display, Formatter};

/// A position in a schema or model source, 1-based line and column.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Span {
    /// Byte offset into the source.
    pub offset: usize,
    pub line: u32,
    pub column: u32,
}

impl Span {
    /// Locates `offset` within `source`.
    ///
    /// Columns count bytes, which matches the ASCII-only surface of the
    /// schema and model grammars.
    pub fn locate(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let mut line = 1u32;
        let mut column = 1u32;

        for byte in source.as_bytes()[..offset].iter() {
            if *byte == b'\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }

        Span {
            offset,
            line,
            column,
        }
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}
