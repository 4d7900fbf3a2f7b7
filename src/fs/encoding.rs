//! Reversible escaping of VFAT-forbidden bytes in file names.
//!
//! VFAT rejects control bytes, the set `* ? < > | " : \`, and names ending in
//! `.` or space. The overlay stores such names anyway by rewriting each path
//! component into a restricted alphabet: `%` introduces an escape, `%%` is a
//! literal percent, and `%xx` is the byte with hex value `xx`. Bytes outside
//! the forbidden set pass through untouched, so names that are already legal
//! on VFAT keep their spelling on disk.
//!
//! The transform is bijective per component: `decode(encode(s)) == s` for any
//! byte sequence `s`, and `encode(decode(p)) == p` for any physical name `p`
//! whose escapes are lowercase. Escapes are emitted lowercase but parsed in
//! either case, so a hand-written `%2A` canonicalizes to `%2a` on the next
//! round trip. `/` is the path separator and is never escaped; components are
//! transformed independently, so encoding commutes with path joins.

use std::fmt;

/// Failure to decode a physical name: a `%` escape was clipped at the end of
/// the name or contained a non-hex digit.
///
/// Physical names are produced by this module, so a malformed escape means
/// the underlying directory holds an entry the overlay did not write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEscape {
    reason: &'static str,
}

impl MalformedEscape {
    fn clipped() -> Self {
        MalformedEscape {
            reason: "clipped escape at end of name",
        }
    }

    fn bad_hex() -> Self {
        MalformedEscape {
            reason: "non-hex digit in escape",
        }
    }
}

impl fmt::Display for MalformedEscape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed % escape: {}", self.reason)
    }
}

impl std::error::Error for MalformedEscape {}

fn is_vfat_bad_byte(b: u8) -> bool {
    b < 0x20 || matches!(b, b'*' | b'?' | b'<' | b'>' | b'|' | b'"' | b':' | b'\\')
}

fn is_vfat_bad_last_byte(b: u8) -> bool {
    is_vfat_bad_byte(b) || b == b'.' || b == b' '
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn push_escaped(out: &mut Vec<u8>, b: u8) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.push(b'%');
    out.push(HEX[usize::from(b >> 4)]);
    out.push(HEX[usize::from(b & 0xf)]);
}

fn encode_component(component: &[u8], out: &mut Vec<u8>) {
    for (i, &b) in component.iter().enumerate() {
        if b == b'%' {
            out.extend_from_slice(b"%%");
        } else if is_vfat_bad_byte(b)
            || (i == component.len() - 1 && is_vfat_bad_last_byte(b))
        {
            push_escaped(out, b);
        } else {
            out.push(b);
        }
    }
}

/// Encode a logical path into its physical (VFAT-safe) spelling.
///
/// Splits on `/`, encodes each component, rejoins with `/`. Total on all
/// inputs; the empty path encodes to the empty path.
pub fn encode(logical: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(logical.len());
    let mut first = true;
    for component in logical.split(|&b| b == b'/') {
        if !first {
            out.push(b'/');
        }
        first = false;
        encode_component(component, &mut out);
    }
    out
}

/// Decode a physical path back into its logical spelling.
///
/// Escapes never span a `/`, so the scan need not split components. Accepts
/// upper- or lowercase hex digits.
pub fn decode(physical: &[u8]) -> Result<Vec<u8>, MalformedEscape> {
    let mut out = Vec::with_capacity(physical.len());
    let mut i = 0;
    while i < physical.len() {
        let b = physical[i];
        if b != b'%' {
            out.push(b);
            i += 1;
            continue;
        }

        // Single-byte escape: "%%" -> "%".
        let x = *physical.get(i + 1).ok_or_else(MalformedEscape::clipped)?;
        if x == b'%' {
            out.push(b'%');
            i += 2;
            continue;
        }

        // Two-digit escape: "%xx" -> one byte.
        let y = *physical.get(i + 2).ok_or_else(MalformedEscape::clipped)?;
        match (hex_value(x), hex_value(y)) {
            (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
            _ => return Err(MalformedEscape::bad_hex()),
        }
        i += 3;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every printable byte VFAT accepts anywhere in a name.
    const ALL_GOOD_BYTES: &[u8] =
        b" !#$&'()+,-.0123456789;=@ABCDEFGHIJKLMNOPQRSTUVWXYZ[]^_`abcdefghijklmnopqrstuvwxyz{}~\x7f";

    #[test]
    fn encodes_empty_to_empty() {
        assert_eq!(encode(b""), b"");
    }

    #[test]
    fn encodes_control_bytes() {
        for b in 1u8..0x20 {
            let logical = [b"foo" as &[u8], &[b], b"bar"].concat();
            let expected = format!("foo%{:02x}bar", b).into_bytes();
            assert_eq!(encode(&logical), expected);
        }
    }

    #[test]
    fn encodes_reserved_punctuation() {
        assert_eq!(encode(b"foo*bar"), b"foo%2abar");
        assert_eq!(encode(b"foo?bar"), b"foo%3fbar");
        assert_eq!(encode(b"foo<bar"), b"foo%3cbar");
        assert_eq!(encode(b"foo>bar"), b"foo%3ebar");
        assert_eq!(encode(b"foo|bar"), b"foo%7cbar");
        assert_eq!(encode(b"foo\"bar"), b"foo%22bar");
        assert_eq!(encode(b"foo:bar"), b"foo%3abar");
        assert_eq!(encode(b"foo\\bar"), b"foo%5cbar");
    }

    #[test]
    fn encodes_percent() {
        assert_eq!(encode(b"foo%bar"), b"foo%%bar");
    }

    #[test]
    fn encodes_good_bytes_to_themselves() {
        assert_eq!(encode(ALL_GOOD_BYTES), ALL_GOOD_BYTES);
    }

    #[test]
    fn encodes_high_bytes_to_themselves() {
        for b in 0x80u8..=0xff {
            let logical = [b"foo" as &[u8], &[b], b"bar"].concat();
            assert_eq!(encode(&logical), logical);
        }
    }

    #[test]
    fn encodes_trailing_dot_and_space() {
        assert_eq!(encode(b"foo."), b"foo%2e");
        assert_eq!(encode(b"foo "), b"foo%20");
    }

    #[test]
    fn trailing_rule_applies_per_component() {
        assert_eq!(encode(b"foo./bar"), b"foo%2e/bar");
        assert_eq!(encode(b"foo /bar"), b"foo%20/bar");
    }

    #[test]
    fn dot_and_space_pass_through_mid_component() {
        assert_eq!(encode(b"foo.bar"), b"foo.bar");
        assert_eq!(encode(b"foo bar"), b"foo bar");
    }

    #[test]
    fn encodes_absolute_paths_componentwise() {
        assert_eq!(encode(b"/a*b/c."), b"/a%2ab/c%2e");
        assert_eq!(encode(b"/"), b"/");
    }

    #[test]
    fn encode_commutes_with_join() {
        let a: &[u8] = b"left*";
        let b: &[u8] = b"right.";
        let joined = [a, b"/", b].concat();
        let expected = [encode(a), b"/".to_vec(), encode(b)].concat();
        assert_eq!(encode(&joined), expected);
    }

    #[test]
    fn decodes_empty_to_empty() {
        assert_eq!(decode(b"").unwrap(), b"");
    }

    #[test]
    fn decodes_control_bytes() {
        for b in 1u8..0x20 {
            let physical = format!("foo%{:02x}bar", b).into_bytes();
            let expected = [b"foo" as &[u8], &[b], b"bar"].concat();
            assert_eq!(decode(&physical).unwrap(), expected);
        }
    }

    #[test]
    fn decodes_reserved_punctuation() {
        assert_eq!(decode(b"foo%2abar").unwrap(), b"foo*bar");
        assert_eq!(decode(b"foo%3fbar").unwrap(), b"foo?bar");
        assert_eq!(decode(b"foo%3cbar").unwrap(), b"foo<bar");
        assert_eq!(decode(b"foo%3ebar").unwrap(), b"foo>bar");
        assert_eq!(decode(b"foo%7cbar").unwrap(), b"foo|bar");
        assert_eq!(decode(b"foo%22bar").unwrap(), b"foo\"bar");
        assert_eq!(decode(b"foo%3abar").unwrap(), b"foo:bar");
        assert_eq!(decode(b"foo%5cbar").unwrap(), b"foo\\bar");
    }

    #[test]
    fn decodes_percent() {
        assert_eq!(decode(b"foo%%bar").unwrap(), b"foo%bar");
    }

    #[test]
    fn decodes_good_bytes_to_themselves() {
        assert_eq!(decode(ALL_GOOD_BYTES).unwrap(), ALL_GOOD_BYTES);
    }

    #[test]
    fn decodes_trailing_escapes() {
        assert_eq!(decode(b"foo%2e").unwrap(), b"foo.");
        assert_eq!(decode(b"foo%20").unwrap(), b"foo ");
        assert_eq!(decode(b"foo%2e/bar").unwrap(), b"foo./bar");
    }

    #[test]
    fn decodes_uppercase_hex() {
        assert_eq!(decode(b"foo%2Abar").unwrap(), b"foo*bar");
        assert_eq!(decode(b"foo%2E").unwrap(), b"foo.");
    }

    #[test]
    fn rejects_clipped_escape() {
        assert!(decode(b"foo%").is_err());
        assert!(decode(b"foo%2").is_err());
    }

    #[test]
    fn rejects_non_hex_escape() {
        assert!(decode(b"foo%zzbar").is_err());
        assert!(decode(b"foo%2gbar").is_err());
    }

    #[test]
    fn round_trips_arbitrary_names() {
        let names: &[&[u8]] = &[
            b"plain.txt",
            b"tab\there",
            b"star*quote\"colon:",
            b"trailing.",
            b"trailing ",
            b"100%",
            b"%loaded%",
            b"\x01\x02\x03",
            b"\xc3\xa9clair",
            b"mixed<>|?\\ and more.",
        ];
        for &name in names {
            assert_eq!(decode(&encode(name)).unwrap(), name, "{:?}", name);
        }
    }

    #[test]
    fn decode_then_encode_normalizes_case() {
        assert_eq!(encode(&decode(b"foo%2Abar").unwrap()), b"foo%2abar");
        // Canonical (lowercase) physical names are fixed points.
        assert_eq!(encode(&decode(b"foo%2abar").unwrap()), b"foo%2abar");
    }
}
