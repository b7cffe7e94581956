//! Percent-escaping for the query-string encoded header fields.

use crate::status::Status;

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn must_escape(b: u8) -> bool {
    matches!(b, b'%' | b'&' | b'=') || !(0x21..=0x7e).contains(&b)
}

/// Appends `data` to `out`, percent-escaping `%`, `&`, `=` and any byte
/// outside the printable ASCII range.
pub(crate) fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        if must_escape(b) {
            out.push(b'%');
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0x0f) as usize]);
        } else {
            out.push(b);
        }
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Reverses [`escape_into`]. A truncated or non-hex `%` sequence is a
/// malformed header.
pub(crate) fn unescape(data: &[u8]) -> Result<Vec<u8>, Status> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b == b'%' {
            let (hi, lo) = match (data.get(i + 1), data.get(i + 2)) {
                (Some(&hi), Some(&lo)) => (hi, lo),
                _ => return Err(Status::bad_message("truncated percent escape")),
            };
            match (hex_val(hi), hex_val(lo)) {
                (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                _ => return Err(Status::bad_message("invalid percent escape")),
            }
            i += 3;
        } else {
            out.push(b);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_roundtrip() {
        let input = b"key with spaces & symbols = 100% \xff\x00";
        let mut escaped = Vec::new();
        escape_into(&mut escaped, input);
        assert!(escaped.iter().all(|b| (0x21..=0x7e).contains(b)));
        assert_eq!(unescape(&escaped).unwrap(), input);
    }

    #[test]
    fn test_plain_ascii_untouched() {
        let mut out = Vec::new();
        escape_into(&mut out, b"hello-world_1.2");
        assert_eq!(out, b"hello-world_1.2");
    }

    #[test]
    fn test_truncated_escape_rejected() {
        assert!(unescape(b"abc%4").is_err());
        assert!(unescape(b"%zz").is_err());
    }
}
