//! Diagnostics: subscriber setup and frame dumps.

use std::fmt::Write as _;

pub mod logging;

const HEXDUMP_WIDTH: usize = 16;

/// Offset, hex and printable columns, sixteen bytes per line.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(HEXDUMP_WIDTH).enumerate() {
        let _ = write!(out, "{:08x}  ", row * HEXDUMP_WIDTH);
        for (column, byte) in chunk.iter().enumerate() {
            if column == HEXDUMP_WIDTH / 2 {
                out.push(' ');
            }
            let _ = write!(out, "{byte:02x} ");
        }
        out.push_str(&"   ".repeat(HEXDUMP_WIDTH - chunk.len()));
        out.push(' ');
        out.extend(chunk.iter().map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn hexdump_layout() {
        let dump = hexdump(&[0x00, 0x00, 0x00, 0x02, b'h', b'i']);
        assert_eq!(
            dump,
            format!("00000000  00 00 00 02 68 69 {} ....hi\n", "   ".repeat(10))
        );
        let wide = hexdump(&[b'a'; 17]);
        assert_eq!(wide.lines().count(), 2);
        assert!(wide.lines().nth(1).is_some_and(|line| line.starts_with("00000010  61 ")));
    }
}
