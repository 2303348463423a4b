//! MessagePack primitives shared by the request encoders and the frame reader.
//!
//! The classification helpers look at a single leading byte and say which
//! family of value follows. Encoders always pick the smallest valid form.

use rmp::Marker;
use rmpv::Value;

use crate::error::{Error, Result};

/// Leading byte is an unsigned integer (positive fixint or uint 8/16/32/64).
pub fn is_uint(code: u8) -> bool {
    matches!(
        Marker::from_u8(code),
        Marker::FixPos(_) | Marker::U8 | Marker::U16 | Marker::U32 | Marker::U64
    )
}

/// Leading byte is a map header (fixmap, map 16, map 32).
pub fn is_map(code: u8) -> bool {
    matches!(
        Marker::from_u8(code),
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32
    )
}

/// Leading byte is an array header (fixarray, array 16, array 32).
pub fn is_array(code: u8) -> bool {
    matches!(
        Marker::from_u8(code),
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32
    )
}

/// Leading byte is a string header (fixstr, str 8/16/32).
pub fn is_string(code: u8) -> bool {
    matches!(
        Marker::from_u8(code),
        Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32
    )
}

/// Number of payload bytes following an unsigned integer marker.
///
/// Returns `None` when `code` does not start an unsigned integer.
pub fn uint_width(code: u8) -> Option<usize> {
    match Marker::from_u8(code) {
        Marker::FixPos(_) => Some(0),
        Marker::U8 => Some(1),
        Marker::U16 => Some(2),
        Marker::U32 => Some(4),
        Marker::U64 => Some(8),
        _ => None,
    }
}

/// Decode an unsigned integer from its marker and big-endian payload.
pub fn decode_uint(code: u8, payload: &[u8]) -> Option<u64> {
    let width = uint_width(code)?;
    if payload.len() != width {
        return None;
    }
    if width == 0 {
        return Some(u64::from(code));
    }
    Some(payload.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Encode an unsigned integer in its minimal form.
pub fn encode_uint(buf: &mut Vec<u8>, value: u64) -> Result<()> {
    rmp::encode::write_uint(buf, value)?;
    Ok(())
}

pub fn encode_map_len(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_map_len(buf, len)?;
    Ok(())
}

pub fn encode_array_len(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_array_len(buf, len)?;
    Ok(())
}

pub fn encode_str(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    rmp::encode::write_str(buf, value)?;
    Ok(())
}

pub fn encode_f64(buf: &mut Vec<u8>, value: f64) -> Result<()> {
    rmp::encode::write_f64(buf, value)?;
    Ok(())
}

pub fn encode_bin(buf: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    rmp::encode::write_bin(buf, value)?;
    Ok(())
}

/// Encode an arbitrary dynamic value (tuples, keys, call arguments).
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    rmpv::encode::write_value(buf, value).map_err(|e| Error::Encode(e.to_string()))
}

/// Decode a single value from the front of `input`, advancing it.
pub fn decode_value(input: &mut &[u8]) -> Result<Value> {
    Ok(rmpv::decode::read_value(input)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_uint_markers() {
        for code in [0x00, 0x01, 0x7f, 0xcc, 0xcd, 0xce, 0xcf] {
            assert!(is_uint(code), "{:#x} should be uint", code);
        }
        // Negative fixint, int 8 and float are not unsigned.
        for code in [0xe0, 0xff, 0xd0, 0xcb, 0xc0] {
            assert!(!is_uint(code), "{:#x} should not be uint", code);
        }
    }

    #[test]
    fn test_classifies_container_and_string_markers() {
        assert!(is_map(0x80));
        assert!(is_map(0x8f));
        assert!(is_map(0xde));
        assert!(is_map(0xdf));
        assert!(!is_map(0x90));

        assert!(is_array(0x90));
        assert!(is_array(0x9f));
        assert!(is_array(0xdc));
        assert!(is_array(0xdd));
        assert!(!is_array(0x80));

        assert!(is_string(0xa0));
        assert!(is_string(0xbf));
        assert!(is_string(0xd9));
        assert!(is_string(0xda));
        assert!(is_string(0xdb));
        // bin 8 is not a string
        assert!(!is_string(0xc4));
    }

    #[test]
    fn test_encode_uint_is_minimal() {
        let cases: [(u64, &[u8]); 6] = [
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0xcc, 0x80]),
            (256, &[0xcd, 0x01, 0x00]),
            (65_536, &[0xce, 0x00, 0x01, 0x00, 0x00]),
            (
                u64::from(u32::MAX) + 1,
                &[0xcf, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
            ),
        ];

        for (value, expected) in cases {
            let mut buf = Vec::new();
            encode_uint(&mut buf, value).unwrap();
            assert_eq!(buf, expected, "encoding of {}", value);
            assert!(is_uint(buf[0]));
        }
    }

    #[test]
    fn test_decode_uint_from_marker_and_payload() {
        assert_eq!(decode_uint(0x05, &[]), Some(5));
        assert_eq!(decode_uint(0xcc, &[0xff]), Some(255));
        assert_eq!(decode_uint(0xce, &[0x00, 0x00, 0x01, 0x00]), Some(256));
        assert_eq!(decode_uint(0xce, &[0x00]), None);
        assert_eq!(decode_uint(0x80, &[]), None);
    }
}
