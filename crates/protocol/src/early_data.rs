//! Early-data extraction
//!
//! Clients smuggle their first payload bytes into the
//! `sec-websocket-protocol` header of the upgrade request to save a
//! round trip. The value is base64 in the URL-safe alphabet, usually
//! without padding; clients that encode with the standard alphabet are
//! tolerated.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use thiserror::Error;

/// Early-data decode failures
#[derive(Error, Debug)]
pub enum EarlyDataError {
    #[error("invalid early data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Decode the early-data header value.
///
/// An empty value means the client sent no early data and is not an
/// error. Any other undecodable value is.
pub fn decode_early_data(value: &str) -> Result<Option<Vec<u8>>, EarlyDataError> {
    if value.is_empty() {
        return Ok(None);
    }

    // Fold the standard alphabet into the URL-safe one and drop padding
    // so both encodings are accepted.
    let normalized: String = value
        .chars()
        .filter(|&c| c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();

    let payload = URL_SAFE_NO_PAD.decode(normalized.as_bytes())?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn test_empty_is_no_payload() {
        assert!(decode_early_data("").unwrap().is_none());
    }

    #[test]
    fn test_url_safe_no_pad() {
        let data = vec![0xfb, 0xff, 0xbf, 0x01, 0x02];
        let encoded = URL_SAFE_NO_PAD.encode(&data);

        assert_eq!(decode_early_data(&encoded).unwrap(), Some(data));
    }

    #[test]
    fn test_standard_alphabet_with_padding() {
        // Bytes chosen so the standard encoding contains '+', '/' and '='.
        let data = vec![0xfb, 0xef, 0xff, 0xfe];
        let encoded = STANDARD.encode(&data);
        assert!(encoded.contains('='));

        assert_eq!(decode_early_data(&encoded).unwrap(), Some(data));
    }

    #[test]
    fn test_matches_standard_decoding() {
        let data = b"GET / HTTP/1.0\r\n\r\n".to_vec();
        let url_safe = URL_SAFE_NO_PAD.encode(&data);
        let standard = STANDARD.encode(&data);

        assert_eq!(
            decode_early_data(&url_safe).unwrap(),
            Some(STANDARD.decode(&standard).unwrap())
        );
    }

    #[test]
    fn test_invalid_input_is_an_error() {
        assert!(decode_early_data("n!ot#base64%").is_err());
    }
}
