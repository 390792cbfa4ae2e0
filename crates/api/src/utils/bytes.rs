use rand::Rng;
use thiserror::Error;

/// An error from a byte utility operation.
#[derive(Error, Debug)]
pub enum ByteUtilsError {
    #[error("Unable to decode hex string {input}: {source}")]
    Decode {
        source: hex::FromHexError,
        input: String,
    },

    #[error("Hex string must start with 0x: {input}")]
    MissingPrefix { input: String },
}

/// Encode bytes as a `0x`-prefixed lowercase hex string.
pub fn hex_encode<T: AsRef<[u8]>>(input: T) -> String {
    format!("0x{}", hex::encode(input))
}

/// Decode a `0x`-prefixed hex string into bytes.
pub fn hex_decode(input: &str) -> Result<Vec<u8>, ByteUtilsError> {
    let stripped = input
        .strip_prefix("0x")
        .ok_or_else(|| ByteUtilsError::MissingPrefix {
            input: input.to_string(),
        })?;
    hex::decode(stripped).map_err(|source| ByteUtilsError::Decode {
        source,
        input: input.to_string(),
    })
}

/// Encode the first 3 bytes with a `..` suffix, for log lines that reference long ids.
pub fn hex_encode_compact<T: AsRef<[u8]>>(input: T) -> String {
    let input = input.as_ref();
    if input.len() <= 4 {
        hex_encode(input)
    } else {
        format!("0x{}..", hex::encode(&input[..3]))
    }
}

/// Generate a random 32-byte array with a minimum number of leading zero bits.
///
/// The byte containing the first possibly-set bit is masked so that exactly
/// `leading_zero_bits % 8` of its high bits are forced to zero.
pub fn random_32byte_array(leading_zero_bits: u8) -> [u8; 32] {
    let first_possible_nonzero_byte = (leading_zero_bits / 8) as usize;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);

    for byte in bytes.iter_mut().take(first_possible_nonzero_byte) {
        *byte = 0;
    }
    if first_possible_nonzero_byte < 32 {
        let mask = 0xffu8 >> (leading_zero_bits % 8);
        bytes[first_possible_nonzero_byte] &= mask;
        // Guarantee the first permitted bit is actually set, so the value has
        // exactly the requested number of leading zeroes.
        bytes[first_possible_nonzero_byte] |= mask ^ (mask >> 1);
    }
    bytes
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::*;

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x00, 0x01, 0xab, 0xff];
        let encoded = hex_encode(&bytes);
        assert_eq!(encoded, "0x0001abff");
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn hex_decode_rejects_missing_prefix() {
        assert!(hex_decode("0001abff").is_err());
    }

    #[test]
    fn compact_encoding() {
        assert_eq!(hex_encode_compact([0xab; 32]), "0xababab..");
        assert_eq!(hex_encode_compact([0x01, 0x02]), "0x0102");
    }

    #[test]
    fn random_array_leading_zeroes() {
        for leading_zero_bits in [0u8, 1, 7, 8, 9, 100, 255] {
            let bytes = random_32byte_array(leading_zero_bits);
            let leading = bytes
                .iter()
                .flat_map(|byte| (0..8).rev().map(move |i| byte >> i & 1))
                .take_while(|bit| *bit == 0)
                .count();
            assert_eq!(leading, leading_zero_bits as usize);
        }
    }
}
