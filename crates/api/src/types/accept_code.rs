use std::ops::{Deref, DerefMut};

use ssz::{Decode, Encode};
use ssz_types::{typenum, BitList, VariableList};
use thiserror::Error;

use super::protocol_versions::ProtocolVersion;

/// Per-key response to an OFFER.
///
/// Version 0 of the protocol carries only a bitlist on the wire, so only `Accepted` and
/// `Declined` survive a round trip at that version. Version 1 carries one code per offered key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptCode {
    /// The content was accepted.
    Accepted,
    /// Generic decline, catch all if there is no more specific case.
    Declined,
    /// Declined, content already stored.
    AlreadyStored,
    /// Declined, content not within the node's radius.
    NotWithinRadius,
    /// Declined, rate limit reached. Node can't handle anymore transfers.
    RateLimited,
    /// Declined, a transfer of this content is already inbound.
    InboundTransferInProgress,
    /// Unspecified accept code, this should not be sent.
    Unspecified,
}

impl From<AcceptCode> for u8 {
    fn from(code: AcceptCode) -> u8 {
        match code {
            AcceptCode::Accepted => 0,
            AcceptCode::Declined => 1,
            AcceptCode::AlreadyStored => 2,
            AcceptCode::NotWithinRadius => 3,
            AcceptCode::RateLimited => 4,
            AcceptCode::InboundTransferInProgress => 5,
            AcceptCode::Unspecified => 6,
        }
    }
}

impl From<u8> for AcceptCode {
    fn from(byte: u8) -> AcceptCode {
        match byte {
            0 => AcceptCode::Accepted,
            1 => AcceptCode::Declined,
            2 => AcceptCode::AlreadyStored,
            3 => AcceptCode::NotWithinRadius,
            4 => AcceptCode::RateLimited,
            5 => AcceptCode::InboundTransferInProgress,
            _ => AcceptCode::Unspecified,
        }
    }
}

impl Encode for AcceptCode {
    fn is_ssz_fixed_len() -> bool {
        <u8 as Encode>::is_ssz_fixed_len()
    }

    fn ssz_fixed_len() -> usize {
        <u8 as Encode>::ssz_fixed_len()
    }

    fn ssz_bytes_len(&self) -> usize {
        <u8 as Encode>::ssz_bytes_len(&u8::from(*self))
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        <u8 as Encode>::ssz_append(&u8::from(*self), buf)
    }
}

impl Decode for AcceptCode {
    fn is_ssz_fixed_len() -> bool {
        <u8 as Decode>::is_ssz_fixed_len()
    }

    fn ssz_fixed_len() -> usize {
        <u8 as Decode>::ssz_fixed_len()
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        u8::from_ssz_bytes(bytes).map(AcceptCode::from)
    }
}

/// The normalized form of an ACCEPT key container, one code per offered key.
///
/// Both wire forms (the v0 bitlist and the v1 code list) decode into this type, so everything
/// past the codec is version-agnostic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptCodeList(VariableList<AcceptCode, typenum::U64>);

impl AcceptCodeList {
    /// Creates a new list with the specified capacity, initialized to `AcceptCode::Declined`.
    ///
    /// Errors if the capacity is greater than 64, the offer key limit.
    pub fn new(capacity: usize) -> Result<Self, ssz_types::Error> {
        VariableList::new(vec![AcceptCode::Declined; capacity]).map(Self)
    }

    /// Sets the accept code at position `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    pub fn set(&mut self, index: usize, value: AcceptCode) {
        let len = self.len();
        match self.0.get_mut(index) {
            Some(code) => *code = value,
            None => panic!("Index out of bounds: index {index} is greater than len {len}"),
        }
    }

    /// Returns true if no key was accepted.
    pub fn all_declined(&self) -> bool {
        !self.contains(&AcceptCode::Accepted)
    }

    /// Returns the indices of the accepted keys, in offer order.
    pub fn accepted_indices(&self) -> Vec<usize> {
        self.iter()
            .enumerate()
            .filter(|(_, code)| **code == AcceptCode::Accepted)
            .map(|(index, _)| index)
            .collect()
    }

    /// Encodes into the wire form for the given protocol version.
    pub fn encode(&self, protocol_version: ProtocolVersion) -> Result<Vec<u8>, AcceptCodeListError> {
        if protocol_version.is_v1_enabled() {
            Ok(self.0.as_ssz_bytes())
        } else {
            let mut v0_content_keys = BitList::<typenum::U64>::with_capacity(self.0.len())?;
            for (index, code) in self.0.iter().enumerate() {
                v0_content_keys.set(index, code == &AcceptCode::Accepted)?;
            }
            Ok(v0_content_keys.as_ssz_bytes())
        }
    }

    /// Decodes the wire form for the given protocol version.
    ///
    /// A v0 bitlist normalizes to `Accepted`/`Declined`; a reader cannot recover the reason for
    /// a v0 rejection. At v1, byte values past `Unspecified` are outside the code range and
    /// reject the whole list.
    pub fn decode(
        protocol_version: ProtocolVersion,
        raw_content_keys: &[u8],
    ) -> Result<AcceptCodeList, AcceptCodeListError> {
        if protocol_version.is_v1_enabled() {
            // The SSZ encoding of a `List[u8]` is the bytes themselves, so the range check can
            // run on the raw payload.
            if raw_content_keys
                .iter()
                .any(|byte| *byte > u8::from(AcceptCode::Unspecified))
            {
                return Err(AcceptCodeListError::UnknownAcceptCode);
            }
            let codes = VariableList::<AcceptCode, typenum::U64>::from_ssz_bytes(raw_content_keys)?;
            Ok(AcceptCodeList(codes))
        } else {
            let v0_content_keys = BitList::<typenum::U64>::from_ssz_bytes(raw_content_keys)?;
            let mut accept_code_list = AcceptCodeList::new(v0_content_keys.len())?;
            for (index, bit) in v0_content_keys.iter().enumerate() {
                if bit {
                    accept_code_list.set(index, AcceptCode::Accepted);
                }
            }
            Ok(accept_code_list)
        }
    }
}

impl Deref for AcceptCodeList {
    type Target = [AcceptCode];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AcceptCodeList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug, Error)]
pub enum AcceptCodeListError {
    #[error("Failed to decode accept code list (SSZ): {0}")]
    DecodeError(String),

    #[error("SSZ types error: {0}")]
    SszTypesError(String),

    #[error("Accept code outside the known range")]
    UnknownAcceptCode,
}

impl From<ssz::DecodeError> for AcceptCodeListError {
    fn from(err: ssz::DecodeError) -> Self {
        AcceptCodeListError::DecodeError(format!("{err:?}"))
    }
}

impl From<ssz_types::Error> for AcceptCodeListError {
    fn from(err: ssz_types::Error) -> Self {
        AcceptCodeListError::SszTypesError(format!("{err:?}"))
    }
}

impl From<ssz::BitfieldError> for AcceptCodeListError {
    fn from(err: ssz::BitfieldError) -> Self {
        AcceptCodeListError::SszTypesError(format!("{err:?}"))
    }
}
