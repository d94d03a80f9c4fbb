//! Directory operations.
//!
//! The consensus core never inspects these: it orders the canonical byte
//! encoding as an opaque request. Only the directory collaborator decodes
//! and applies them.

use crate::canonical::{to_canonical_bytes, CodecError};
use serde::{Deserialize, Serialize};

/// A client operation on the (alias → public key) directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// Bind a new alias. Fails at the gateway if the alias exists.
    Create { alias: String, key: String },
    /// Replace an existing binding. Fails at the gateway if absent.
    Update { alias: String, key: String },
    /// Read a binding. Served locally, never ordered.
    Lookup { alias: String },
}

impl Operation {
    /// The alias this operation touches.
    pub fn alias(&self) -> &str {
        match self {
            Operation::Create { alias, .. }
            | Operation::Update { alias, .. }
            | Operation::Lookup { alias } => alias,
        }
    }

    /// Whether this operation mutates the directory and must be ordered.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::Lookup { .. })
    }

    /// Canonical byte form carried through consensus.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        to_canonical_bytes(self)
    }

    /// Decode from the canonical byte form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let op = Operation::Create {
            alias: "alice".into(),
            key: "keyA".into(),
        };
        let decoded = Operation::decode(&op.encode().unwrap()).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn encoding_is_canonical() {
        let op = Operation::Update {
            alias: "bob".into(),
            key: "keyB".into(),
        };
        assert_eq!(
            String::from_utf8(op.encode().unwrap()).unwrap(),
            r#"{"alias":"bob","key":"keyB","op":"update"}"#
        );
    }

    #[test]
    fn lookup_is_not_a_mutation() {
        assert!(!Operation::Lookup {
            alias: "alice".into()
        }
        .is_mutation());
        assert!(Operation::Create {
            alias: "alice".into(),
            key: "k".into()
        }
        .is_mutation());
    }
}
