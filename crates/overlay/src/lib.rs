//! The overlay protocol engine: a Kademlia-style routing table over XOR distance, the five
//! portal request/response message pairs with per-peer version negotiation, OFFER/ACCEPT
//! content distribution over reliable streams, α-parallel recursive lookups, and neighborhood
//! gossip.
//!
//! The discovery-layer packet transport and the reliable-stream transport are consumed through
//! the traits in [`transport`]; content storage is consumed through `portal_storage`.

pub mod accept_queue;
pub mod constants;
pub mod find;
pub mod gossip;
pub mod overlay;
pub mod stream;
pub mod transport;
pub mod types;
pub mod utils;
pub mod versions;
