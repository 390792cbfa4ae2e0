use ssz_types::{typenum, VariableList};

/// A byte list of at most 2048 bytes, the PING/PONG custom payload container.
pub type ByteList2048 = VariableList<u8, typenum::U2048>;
