//! High-bit ("take-out") encoding for quote characters.
//!
//! Quoted protocol values may not contain quote bytes.  The sender sets
//! the high bit on every `'` and `"` before quoting; the receiver clears
//! the high bit on every byte of the decoded value.  Round-tripping is
//! exact as long as the original value was 7-bit clean.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TakeoutError {
    #[error("byte {byte:#04x} at offset {offset} already has the high bit set")]
    HighBitSet { byte: u8, offset: usize },
}

/// Encodes `src` for transmission inside a quoted protocol value.
///
/// Fails if any input byte already carries the high bit, since decoding
/// would then corrupt it.
pub fn encode(src: &[u8]) -> Result<Vec<u8>, TakeoutError> {
    if let Some(offset) = src.iter().position(|&b| b & 0x80 != 0) {
        return Err(TakeoutError::HighBitSet {
            byte: src[offset],
            offset,
        });
    }
    Ok(src
        .iter()
        .map(|&b| if b == b'\'' || b == b'"' { b | 0x80 } else { b })
        .collect())
}

/// Decodes a received quoted value by clearing the high bit on every byte.
pub fn decode(src: &[u8]) -> Vec<u8> {
    src.iter().map(|&b| b & 0x7f).collect()
}

/// Decodes a received quoted value into a `String`.
///
/// The mask forces every byte into the ASCII range, so the result is
/// always valid UTF-8.
pub fn decode_to_string(src: &[u8]) -> String {
    String::from_utf8(decode(src)).expect("masked bytes are ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn quotes_are_high_bitted() {
        let encoded = encode(b"don't \"quote\" me").expect("7-bit input");
        assert_eq!(
            encoded,
            [
                b'd', b'o', b'n', 0xa7, b't', b' ', 0xa2, b'q', b'u', b'o',
                b't', b'e', 0xa2, b' ', b'm', b'e'
            ]
        );
        assert_eq!(decode(&encoded), b"don't \"quote\" me");
    }

    #[test]
    fn high_bit_input_is_rejected() {
        let err = encode(&[b'a', 0x80, b'b']).unwrap_err();
        assert_eq!(
            err,
            TakeoutError::HighBitSet {
                byte: 0x80,
                offset: 1
            }
        );
    }

    #[test]
    fn decode_clears_every_high_bit() {
        assert_eq!(decode(&[0xff, 0x41, 0xa7]), vec![0x7f, 0x41, b'\'']);
    }

    proptest! {
        #[test]
        fn prop_round_trips_seven_bit_input(
            input in proptest::collection::vec(0u8..0x80, 0..256),
        ) {
            let encoded = encode(&input).expect("7-bit input encodes");
            prop_assert_eq!(decode(&encoded), input);
        }

        #[test]
        fn prop_encoded_output_never_contains_bare_quotes(
            input in proptest::collection::vec(0u8..0x80, 0..256),
        ) {
            let encoded = encode(&input).expect("7-bit input encodes");
            prop_assert!(!encoded.contains(&b'\''));
            prop_assert!(!encoded.contains(&b'"'));
        }
    }
}
