//! Hex-and-ASCII rendering of byte buffers for decoder diagnostics.

use std::fmt;

const ROW_SIZE: usize = 16;

/// Wraps a byte slice for hexdump display. `base` shifts the printed
/// offsets, e.g. to the buffer's address in the tracee.
pub struct Hexdump<'a> {
    data: &'a [u8],
    base: u64,
}

impl<'a> Hexdump<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, base: 0 }
    }

    pub fn with_base(data: &'a [u8], base: u64) -> Self {
        Self { data, base }
    }
}

impl fmt::Display for Hexdump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (row, chunk) in self.data.chunks(ROW_SIZE).enumerate() {
            write!(f, "{:#08x}: ", self.base + (row * ROW_SIZE) as u64)?;
            for column in 0..ROW_SIZE {
                if column > 0 && column % 8 == 0 {
                    write!(f, " ")?;
                }
                match chunk.get(column) {
                    Some(byte) => write!(f, "{byte:02x} ")?,
                    None => write!(f, "   ")?,
                }
            }
            write!(f, " ")?;
            for (column, byte) in chunk.iter().enumerate() {
                if column > 0 && column % 8 == 0 {
                    write!(f, " ")?;
                }
                let shown = if byte.is_ascii_graphic() || *byte == b' ' {
                    *byte as char
                } else {
                    '.'
                };
                write!(f, "{shown}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
