//! Deterministic canonical JSON encoding.
//!
//! Every signature and self-digest in the protocol is computed over this
//! encoding, so it must be byte-identical across replicas: object keys in
//! alphabetical order, no insignificant whitespace. Encoding goes through
//! `serde_json::Value`, whose object map is a `BTreeMap` and therefore
//! serializes keys sorted.

use serde::Serialize;
use thiserror::Error;

/// Errors from canonical encoding or decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("canonical encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("decoding failed: {0}")]
    Decode(serde_json::Error),
}

/// Encode a value into its canonical JSON byte form.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Zeta {
        zulu: u32,
        alpha: &'static str,
        mike: bool,
    }

    #[test]
    fn keys_are_sorted() {
        let bytes = to_canonical_bytes(&Zeta {
            zulu: 1,
            alpha: "x",
            mike: true,
        })
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":"x","mike":true,"zulu":1}"#
        );
    }

    #[test]
    fn encoding_is_deterministic() {
        let v = Zeta {
            zulu: 7,
            alpha: "y",
            mike: false,
        };
        assert_eq!(
            to_canonical_bytes(&v).unwrap(),
            to_canonical_bytes(&v).unwrap()
        );
    }
}
