use std::{
    net::Ipv4Addr,
    ops::{Deref, DerefMut},
};

use discv5::enr::{CombinedKey, Enr as Discv5Enr};
use rand::Rng;
use ssz::DecodeError;

pub type Enr = Discv5Enr<CombinedKey>;

/// An ENR as it travels inside SSZ lists: the RLP encoding of the record.
#[derive(Debug, PartialEq, Clone)]
pub struct SszEnr(pub Enr);

impl SszEnr {
    pub fn new(enr: Enr) -> SszEnr {
        SszEnr(enr)
    }
}

impl From<SszEnr> for Enr {
    fn from(ssz_enr: SszEnr) -> Self {
        ssz_enr.0
    }
}

impl Deref for SszEnr {
    type Target = Enr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SszEnr {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl ssz::Decode for SszEnr {
    fn is_ssz_fixed_len() -> bool {
        false
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let enr = alloy_rlp::Decodable::decode(&mut &bytes[..])
            .map_err(|err| DecodeError::BytesInvalid(format!("rlp decoding failed: {err}")))?;
        Ok(SszEnr(enr))
    }
}

impl ssz::Encode for SszEnr {
    fn is_ssz_fixed_len() -> bool {
        false
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&alloy_rlp::encode(&self.0));
    }

    fn ssz_bytes_len(&self) -> usize {
        alloy_rlp::encode(&self.0).len()
    }
}

/// Generates an ENR for a remote peer with a random IP, along with its secret key.
pub fn generate_random_remote_enr() -> (CombinedKey, Enr) {
    let key = CombinedKey::generate_secp256k1();

    let mut rng = rand::rng();
    let ip = Ipv4Addr::from(rng.random::<u32>());

    let enr = Enr::builder()
        .ip(ip.into())
        .udp4(8000)
        .build(&key)
        .expect("Failed to generate random ENR.");

    (key, enr)
}
