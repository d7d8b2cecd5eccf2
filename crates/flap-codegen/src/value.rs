//! Universal value representation
//!
//! Every runtime value is 64 bits, read as an IEEE-754 binary64 or as an
//! unboxed pointer through its bit pattern. Lists and maps are f64 cells:
//! a list is `[length][elem0]...`, a map `[count][k0][v0][k1][v1]...`, a
//! string a dense map of codepoints keyed 0..n-1.
//!
//! Errors are quiet NaNs carrying a 4-byte ASCII tag in the low mantissa
//! bits. The hardware's canonical NaN has an all-zero payload, so tagged
//! errors never collide with ordinary float results.

/// High 32 bits of every tagged error value.
pub const ERROR_HI: u32 = 0x7FF8_0000;

/// Division by zero.
pub const TAG_DIV0: [u8; 4] = *b"div0";
/// Map lookup miss.
pub const TAG_KEY: [u8; 4] = *b"key!";

/// Build the bit pattern of a tagged error value.
pub fn error_bits(tag: [u8; 4]) -> u64 {
    (ERROR_HI as u64) << 32 | u32::from_le_bytes(tag) as u64
}

/// True when `bits` is a NaN-tagged error (and not a plain NaN).
pub fn is_error_bits(bits: u64) -> bool {
    (bits >> 32) as u32 == ERROR_HI && bits as u32 != 0
}

/// Serialized `.rodata` form of a list literal.
pub fn list_bytes(elems: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 * (elems.len() + 1));
    out.extend_from_slice(&(elems.len() as f64).to_le_bytes());
    for e in elems {
        out.extend_from_slice(&e.to_le_bytes());
    }
    out
}

/// Serialized `.rodata` form of a map literal.
pub fn map_bytes(entries: &[(f64, f64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 16 * entries.len());
    out.extend_from_slice(&(entries.len() as f64).to_le_bytes());
    for (k, v) in entries {
        out.extend_from_slice(&k.to_le_bytes());
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Serialized `.rodata` form of a string literal: a dense codepoint map.
pub fn string_bytes(s: &str) -> Vec<u8> {
    let entries: Vec<(f64, f64)> =
        s.chars().enumerate().map(|(i, c)| (i as f64, c as u32 as f64)).collect();
    map_bytes(&entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_bits_round_trip() {
        let bits = error_bits(TAG_DIV0);
        assert!(is_error_bits(bits));
        assert!(f64::from_bits(bits).is_nan());
        assert_eq!(&bits.to_le_bytes()[0..4], b"div0");
    }

    #[test]
    fn test_plain_nan_is_not_error() {
        assert!(!is_error_bits(f64::NAN.to_bits()));
        assert!(!is_error_bits(1.5f64.to_bits()));
    }

    #[test]
    fn test_list_layout() {
        let bytes = list_bytes(&[1.0, 2.0, 3.0]);
        assert_eq!(bytes.len(), 32);
        assert_eq!(f64::from_le_bytes(bytes[0..8].try_into().unwrap()), 3.0);
        assert_eq!(f64::from_le_bytes(bytes[24..32].try_into().unwrap()), 3.0);
    }

    #[test]
    fn test_string_is_dense_codepoint_map() {
        let bytes = string_bytes("hi");
        // count=2, then (0,'h'), (1,'i')
        assert_eq!(bytes.len(), 8 + 32);
        assert_eq!(f64::from_le_bytes(bytes[0..8].try_into().unwrap()), 2.0);
        assert_eq!(f64::from_le_bytes(bytes[16..24].try_into().unwrap()), 'h' as u32 as f64);
        assert_eq!(f64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0.0);
    }
}
