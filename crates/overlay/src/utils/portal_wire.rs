use std::io::{self, BufRead, Read, Write};

use anyhow::anyhow;
use bytes::{buf::Reader, Buf, BufMut, Bytes, BytesMut};

fn decode_next_content_item(reader: &mut Reader<Bytes>) -> io::Result<Option<Bytes>> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None); // Nothing left to read
    }

    // Read LEB128 length prefix
    let varint = read_varint(reader)?;

    // Read the content item
    let mut buf = BytesMut::zeroed(varint as usize);
    reader.read_exact(&mut buf)?;
    Ok(Some(buf.freeze()))
}

/// Decode content values from a stream payload. All content values are encoded with a LEB128
/// varint prefix which indicates the length in bytes of the consecutive content item.
pub fn decode_content_payload(payload: Bytes) -> io::Result<Vec<Bytes>> {
    let mut reader = payload.reader();
    let mut content_values = Vec::new();

    while let Some(item) = decode_next_content_item(&mut reader)? {
        content_values.push(item);
    }

    Ok(content_values)
}

/// Decodes a content value from a find-content stream payload. Expects a single piece of content
/// which is encoded with a LEB128 varint prefix which indicates the length in bytes of the
/// content. Trailing bytes after the framed value mean the framing is broken.
pub fn decode_single_content_payload(payload: Bytes) -> io::Result<Bytes> {
    let mut reader = payload.reader();

    let content_value = decode_next_content_item(&mut reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "No content found"))?;

    if !reader.fill_buf()?.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "content length mismatch",
        ));
    }
    Ok(content_value)
}

/// A variable length unsigned integer (varint) is prefixed to each content item.
// The varint holds the size, in bytes, of the subsequent content item.
//
// The varint encoding used is [Unsigned LEB128](https://en.wikipedia.org/wiki/LEB128#Encode_unsigned_integer).
// The maximum content size allowed for this application is limited to `uint32`.
pub fn encode_content_payload<T: AsRef<[u8]>>(content_items: &[T]) -> anyhow::Result<BytesMut> {
    let mut content_payload = BytesMut::new().writer();

    for content_item in content_items {
        let content_item = content_item.as_ref();
        if content_item.len() > u32::MAX as usize {
            return Err(anyhow!(
                "Content item exceeds max allowed size of u32 bytes"
            ));
        }

        leb128::write::unsigned(&mut content_payload, content_item.len() as u64)
            .map_err(|err| anyhow!("Unable to encode LEB128 varint: {err}"))?;
        content_payload
            .write(content_item)
            .map_err(|err| anyhow!("unable to write to content payload buf: {err}"))?;
    }
    Ok(content_payload.into_inner())
}

/// Encodes a single content value with its LEB128 length prefix.
pub fn encode_single_content_payload<T: AsRef<[u8]>>(content_item: T) -> anyhow::Result<BytesMut> {
    encode_content_payload(&[content_item])
}

/// Try to read up to five LEB128 bytes (The maximum content size allowed for this application is
/// limited to `uint32`).
pub fn read_varint(reader: &mut Reader<Bytes>) -> io::Result<u32> {
    let varint = leb128::read::unsigned(reader)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    u32::try_from(varint).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(u8::MIN as u32)]
    #[case(u8::MAX as u32)]
    #[case(u16::MAX as u32)]
    #[case(u32::MAX)]
    fn test_read_varint(#[case] varint: u32) {
        let mut buf = Vec::new();
        let bytes_written = leb128::write::unsigned(&mut buf, varint as u64).unwrap();

        let mut reader = Bytes::from(buf).reader();
        let original_len = reader.get_ref().len();
        let varint_result = read_varint(&mut reader).unwrap();
        let bytes_read = original_len - reader.get_ref().len();

        assert_eq!(varint_result, varint);
        assert_eq!(bytes_read, bytes_written);
    }

    #[test_log::test]
    fn test_read_varint_rejects_oversized_value() {
        let mut buf = Vec::new();
        leb128::write::unsigned(&mut buf, u32::MAX as u64 + 1).unwrap();

        let mut reader = Bytes::from(buf).reader();
        assert_eq!(
            read_varint(&mut reader).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test_log::test]
    fn test_decode_content_payload_corrupted() {
        // First item claims 3 bytes, second claims 2 bytes but only 1 remains.
        let payload = Bytes::from_static(&[0x03, 0x01, 0x01, 0x01, 0x02, 0x01]);
        assert_eq!(
            decode_content_payload(payload).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test_log::test]
    fn test_decode_single_content_payload_too_much_data() {
        let payload = Bytes::from_static(&[0x02, 0x01, 0x01, 0x22]);
        let err = decode_single_content_payload(payload).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "content length mismatch");
    }

    #[test_log::test]
    fn test_single_content_payload_round_trip_large() {
        let content: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

        let payload = encode_single_content_payload(&content).unwrap().freeze();
        let decoded = decode_single_content_payload(payload.clone()).unwrap();
        assert_eq!(decoded, content);

        // Dropping the final byte breaks the framing.
        let truncated = payload.slice(..payload.len() - 1);
        assert!(decode_single_content_payload(truncated).is_err());
    }

    #[test_log::test]
    fn test_encode_decode_content_payload() {
        let expected_content_items: Vec<Vec<u8>> = vec![vec![1, 1], vec![2, 2, 2]];

        let content_payload = encode_content_payload(&expected_content_items).unwrap();
        let content_items: Vec<Vec<u8>> = decode_content_payload(content_payload.freeze())
            .unwrap()
            .into_iter()
            .map(|content| content.to_vec())
            .collect();

        assert_eq!(content_items, expected_content_items);
    }
}
