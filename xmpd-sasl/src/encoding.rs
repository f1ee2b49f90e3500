//! Strict base64 handling for SASL payloads.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use xmpd_common::error::SaslError;

/// Decodes a SASL payload, rejecting anything outside the base64 alphabet.
///
/// Padding may only occupy the final two characters. Input that passes the alphabet check
/// but is not canonical base64 is rejected by the decoder.
///
/// # Errors
///
/// Returns `SaslError::IncorrectEncoding` for any malformed payload.
pub fn decode_strict(text: &str) -> Result<Vec<u8>, SaslError> {
    if !is_strict_base64(text) {
        return Err(SaslError::IncorrectEncoding);
    }
    STANDARD
        .decode(text)
        .map_err(|_| SaslError::IncorrectEncoding)
}

/// Encodes bytes for a challenge element.
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn is_strict_base64(text: &str) -> bool {
    let bytes = text.as_bytes();
    let tail_start = bytes.len().saturating_sub(2);
    bytes.iter().enumerate().all(|(index, byte)| match byte {
        b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z' | b'+' | b'/' => true,
        b'=' => index >= tail_start,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::{decode_strict, encode};
    use googletest::prelude::*;
    use rstest::rstest;
    use xmpd_common::error::SaslError;

    #[rstest]
    #[case("AGFsaWNlAHNlY3JldA==", b"\0alice\0secret".as_slice())]
    #[case("Zm9v", b"foo".as_slice())]
    #[case("", b"".as_slice())]
    fn decodes_canonical_payloads(#[case] text: &str, #[case] expected: &[u8]) {
        let decoded = decode_strict(text).expect("payload should decode");
        assert_that!(decoded.as_slice(), eq(expected));
    }

    #[rstest]
    #[case("Zm9v\n")]
    #[case("Zm 9v")]
    #[case("Zm=9v")]
    #[case("Z===")]
    #[case("Zm9v*")]
    #[case("Zm9")]
    fn rejects_non_alphabet_or_misplaced_padding(#[case] text: &str) {
        assert_that!(&decode_strict(text), eq(&Err(SaslError::IncorrectEncoding)));
    }

    #[rstest]
    fn encode_produces_padded_output() {
        assert_that!(encode(b"rspauth").as_str(), eq("cnNwYXV0aA=="));
    }
}
