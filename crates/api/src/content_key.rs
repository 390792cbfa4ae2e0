use std::{fmt, hash::Hash};

use crate::{utils::bytes::hex_encode, RawContentKey};

/// Types whose values identify content on an overlay network.
///
/// The key-to-id mapping must be pure and total: equal keys always produce the same 32-byte
/// content id, and decoding is the only fallible step. A key that fails to decode is treated by
/// the protocol as malformed and rejects the operation that carried it.
pub trait OverlayContentKey:
    Clone + fmt::Debug + fmt::Display + Eq + PartialEq + Hash + Send + Sync + 'static
{
    /// Returns the content id: the fixed 32-byte point of this key in the DHT key space.
    fn content_id(&self) -> [u8; 32];

    /// Returns the wire encoding of this key.
    fn to_bytes(&self) -> RawContentKey;

    /// Decodes a key from its wire encoding.
    fn try_from_bytes(bytes: impl AsRef<[u8]>) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Whether storage of this content is bounded by the node's radius.
    fn affected_by_radius(&self) -> bool {
        true
    }
}

/// A content key whose content id is the key itself. Only useful for testing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdentityContentKey([u8; 32]);

impl IdentityContentKey {
    /// Constructs a new key from the given value.
    pub fn new(value: [u8; 32]) -> Self {
        Self(value)
    }

    /// Constructs a random key.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for IdentityContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex_encode(self.0))
    }
}

impl OverlayContentKey for IdentityContentKey {
    fn content_id(&self) -> [u8; 32] {
        self.0
    }

    fn to_bytes(&self) -> RawContentKey {
        self.0.to_vec()
    }

    fn try_from_bytes(bytes: impl AsRef<[u8]>) -> anyhow::Result<Self> {
        let bytes = bytes.as_ref();
        let value: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Identity content key requires 32 bytes"))?;
        Ok(Self(value))
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::*;

    #[test]
    fn identity_round_trip() {
        let key = IdentityContentKey::random();
        let decoded = IdentityContentKey::try_from_bytes(key.to_bytes()).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(decoded.content_id(), key.content_id());
    }

    #[test]
    fn identity_rejects_wrong_length() {
        assert!(IdentityContentKey::try_from_bytes([0u8; 31]).is_err());
        assert!(IdentityContentKey::try_from_bytes([0u8; 33]).is_err());
    }
}
