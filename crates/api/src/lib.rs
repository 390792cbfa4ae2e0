//! Wire and data types for the Portal overlay protocol: the XOR distance algebra, ENR helpers,
//! protocol-version negotiation primitives, accept codes, and the portal wire messages with
//! their bit-exact SSZ encodings.

pub mod content_key;
pub mod types;
pub mod utils;

pub use content_key::{IdentityContentKey, OverlayContentKey};
pub use types::{
    enr::generate_random_remote_enr, node_id::generate_random_node_id,
};

/// The wire encoding of a content key.
pub type RawContentKey = Vec<u8>;

/// The raw bytes of a content value.
pub type RawContentValue = Vec<u8>;
