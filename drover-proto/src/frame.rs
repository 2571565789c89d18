//! Binary frame format for box messages.
//!
//! Frame layout, repeated once per key and closed by a zero key length:
//!
//! ```text
//! +---------+-----------+-----------+-------------+     +--------+
//! | key_len | key bytes | value_len | value bytes | ... | 0x0000 |
//! | 2 bytes | key_len   |  2 bytes  | value_len   |     | 2 bytes|
//! +---------+-----------+-----------+-------------+     +--------+
//! ```
//!
//! All length fields are big-endian 16-bit integers. A key length of zero
//! terminates the frame; key lengths above 255 are invalid on the wire.

use crate::error::ProtocolError;
use crate::message::Message;
use crate::{MAX_KEY_LEN, MAX_VALUE_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encodes a box into its wire frame.
///
/// Fails if any key is empty or longer than 255 bytes, or any value is
/// longer than 65535 bytes. Key order on the wire is whatever the map
/// iterates; decoders must not depend on it.
pub fn encode(msg: &Message) -> Result<BytesMut, ProtocolError> {
    msg.validate()?;

    let mut size = 2;
    for (key, value) in msg.iter() {
        size += 2 + key.len() + 2 + value.len();
    }

    let mut buf = BytesMut::with_capacity(size);
    for (key, value) in msg.iter() {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u16(value.len() as u16);
        buf.put_slice(value);
    }
    buf.put_u16(0);
    Ok(buf)
}

/// Decodes one box from the front of `buf`.
///
/// Returns `Ok(Some(msg))` when a complete frame was consumed, `Ok(None)`
/// when more bytes are needed, or `Err` on a malformed frame. No bytes are
/// consumed until a full frame is present, so the call is restartable:
/// feeding the same incomplete buffer again yields the same `None`. Bytes
/// beyond the first frame are left in `buf` for pipelined decoding.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    // First pass: find the frame boundary without consuming anything.
    let mut pos = 0;
    loop {
        if pos + 2 > buf.len() {
            return Ok(None);
        }
        let key_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        if key_len == 0 {
            pos += 2;
            break;
        }
        if key_len > MAX_KEY_LEN {
            return Err(ProtocolError::BadKeyLengthField(key_len as u16));
        }
        if pos + 2 + key_len + 2 > buf.len() {
            return Ok(None);
        }
        let value_len =
            u16::from_be_bytes([buf[pos + 2 + key_len], buf[pos + 2 + key_len + 1]]) as usize;
        if pos + 2 + key_len + 2 + value_len > buf.len() {
            return Ok(None);
        }
        pos += 2 + key_len + 2 + value_len;
    }

    // Second pass: the frame is complete, consume and parse it.
    let mut frame = buf.split_to(pos);
    let mut msg = Message::new();
    loop {
        let key_len = frame.get_u16() as usize;
        if key_len == 0 {
            break;
        }
        let key_bytes = frame.split_to(key_len);
        let key = std::str::from_utf8(&key_bytes)
            .map_err(|_| ProtocolError::KeyNotUtf8)?
            .to_string();
        let value_len = frame.get_u16() as usize;
        let value: Bytes = frame.split_to(value_len).freeze();
        if msg.contains(&key) {
            return Err(ProtocolError::DuplicateKey(key));
        }
        msg.insert(key, value);
    }

    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(msg: &Message) -> Message {
        let mut buf = encode(msg).unwrap();
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_roundtrip_simple() {
        let msg = Message::new().with("meth", "mkdir").with("dir", "a/b/c");
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_roundtrip_empty_box() {
        let msg = Message::new();
        let mut buf = encode(&msg).unwrap();
        assert_eq!(&buf[..], &[0, 0]);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_binary_value() {
        let blob: Vec<u8> = (0..=255u8).cycle().take(65535).collect();
        let msg = Message::new().with("data", blob.clone());
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.get("data").unwrap().as_ref(), &blob[..]);
    }

    #[test]
    fn test_encode_rejects_empty_key() {
        let msg = Message::new().with("", "v");
        assert!(matches!(
            encode(&msg),
            Err(ProtocolError::InvalidKeyLength(0))
        ));
    }

    #[test]
    fn test_encode_rejects_long_key() {
        let msg = Message::new().with("k".repeat(256), "v");
        assert!(matches!(
            encode(&msg),
            Err(ProtocolError::InvalidKeyLength(256))
        ));
    }

    #[test]
    fn test_encode_rejects_long_value() {
        let msg = Message::new().with("k", vec![0u8; 65536]);
        assert!(matches!(
            encode(&msg),
            Err(ProtocolError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        let msg = Message::new().with("key", "value");
        let encoded = encode(&msg).unwrap();

        for split in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..split]);
            let before = buf.clone();
            assert!(decode(&mut buf).unwrap().is_none(), "split at {}", split);
            // Nothing consumed, so the call is restartable.
            assert_eq!(buf, before, "split at {}", split);
        }
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let msg = Message::new().with("stream", "stdout").with("data", "hi\n");
        let encoded = encode(&msg).unwrap();

        let mut buf = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            match decode(&mut buf).unwrap() {
                Some(m) => {
                    assert_eq!(i, encoded.len() - 1);
                    decoded = Some(m);
                }
                None => assert!(i < encoded.len() - 1),
            }
        }
        assert_eq!(decoded.unwrap(), msg);
    }

    #[test]
    fn test_decode_pipelined_boxes() {
        let boxes: Vec<Message> = (0..4)
            .map(|i| Message::new().with("seq", format!("{}", i)))
            .collect();

        let mut buf = BytesMut::new();
        for msg in &boxes {
            buf.extend_from_slice(&encode(msg).unwrap());
        }

        for expected in &boxes {
            assert_eq!(&decode(&mut buf).unwrap().unwrap(), expected);
        }
        assert!(decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_duplicate_key() {
        // Hand-crafted frame carrying the key "x" twice.
        let mut buf = BytesMut::new();
        for value in [&b"1"[..], &b"2"[..]] {
            buf.put_u16(1);
            buf.put_slice(b"x");
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
        }
        buf.put_u16(0);

        assert!(matches!(
            decode(&mut buf),
            Err(ProtocolError::DuplicateKey(k)) if k == "x"
        ));
    }

    #[test]
    fn test_decode_rejects_key_length_over_255() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0100);
        // Detected from the length field alone, before any key bytes arrive.
        assert!(matches!(
            decode(&mut buf),
            Err(ProtocolError::BadKeyLengthField(0x0100))
        ));
    }

    #[test]
    fn test_decode_rejects_non_utf8_key() {
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        buf.put_slice(&[0xff, 0xfe]);
        buf.put_u16(0);
        buf.put_u16(0);
        assert!(matches!(decode(&mut buf), Err(ProtocolError::KeyNotUtf8)));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(entries in proptest::collection::btree_map(
            "[a-z_][a-z0-9_]{0,30}",
            proptest::collection::vec(any::<u8>(), 0..512),
            0..8,
        )) {
            let msg: Message = entries.into_iter().collect();
            let mut buf = encode(&msg).unwrap();
            let decoded = decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, msg);
            prop_assert!(buf.is_empty());
        }
    }
}
