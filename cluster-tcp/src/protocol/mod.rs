use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

// Message type identifiers
pub const MSG_INVALIDATE_ITEM: u8 = 0x01;
pub const MSG_INVALIDATE_ALL: u8 = 0x02;
pub const MSG_BROADCAST: u8 = 0x03;

/// Messages exchanged between cluster nodes. Each message is a flat,
/// self-describing value: the byte stream carries everything needed to
/// reconstruct it, no schema lookup on the receiving side.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMessage {
    /// Evict one key from one cache, scoped to a partition when present.
    InvalidateItem {
        cache_name: String,
        key: String,
        partition: Option<String>,
    },
    /// Clear one cache entirely, across all partitions.
    InvalidateAll { cache_name: String },
    /// Application-level pub/sub payload, routed by topic.
    Broadcast {
        topic: String,
        key: String,
        value: Bytes,
    },
}

/// Build the length-delimited codec used on every mesh socket: 4-byte
/// big-endian length prefix, bounded frame size.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

impl ClusterMessage {
    /// Encode into Bytes for transmission.
    ///
    /// Format (strings are UTF-8, length-prefixed with a u32):
    /// - INVALIDATE_ITEM: [0x01][cache_name][key][has_partition: u8][partition?]
    /// - INVALIDATE_ALL: [0x02][cache_name]
    /// - BROADCAST: [0x03][topic][key][value_len: u32][value bytes]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            ClusterMessage::InvalidateItem {
                cache_name,
                key,
                partition,
            } => {
                buf.put_u8(MSG_INVALIDATE_ITEM);
                put_str(&mut buf, cache_name);
                put_str(&mut buf, key);
                match partition {
                    Some(partition) => {
                        buf.put_u8(1);
                        put_str(&mut buf, partition);
                    }
                    None => buf.put_u8(0),
                }
            }
            ClusterMessage::InvalidateAll { cache_name } => {
                buf.put_u8(MSG_INVALIDATE_ALL);
                put_str(&mut buf, cache_name);
            }
            ClusterMessage::Broadcast { topic, key, value } => {
                buf.put_u8(MSG_BROADCAST);
                put_str(&mut buf, topic);
                put_str(&mut buf, key);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
        }

        buf.freeze()
    }

    /// Decode from Bytes received from the network.
    ///
    /// This is called AFTER LengthDelimitedCodec has extracted the frame,
    /// so the buffer holds exactly one complete message.
    pub fn decode(mut buf: Bytes) -> Result<Self, String> {
        if buf.is_empty() {
            return Err("Empty buffer".to_string());
        }

        let tag = buf.get_u8();

        match tag {
            MSG_INVALIDATE_ITEM => {
                let cache_name = get_str(&mut buf, "INVALIDATE_ITEM cache_name")?;
                let key = get_str(&mut buf, "INVALIDATE_ITEM key")?;
                if buf.remaining() < 1 {
                    return Err("Invalid INVALIDATE_ITEM: missing partition flag".to_string());
                }
                let partition = match buf.get_u8() {
                    0 => None,
                    _ => Some(get_str(&mut buf, "INVALIDATE_ITEM partition")?),
                };
                Ok(ClusterMessage::InvalidateItem {
                    cache_name,
                    key,
                    partition,
                })
            }
            MSG_INVALIDATE_ALL => {
                let cache_name = get_str(&mut buf, "INVALIDATE_ALL cache_name")?;
                Ok(ClusterMessage::InvalidateAll { cache_name })
            }
            MSG_BROADCAST => {
                let topic = get_str(&mut buf, "BROADCAST topic")?;
                let key = get_str(&mut buf, "BROADCAST key")?;
                if buf.remaining() < 4 {
                    return Err("Invalid BROADCAST: missing value length".to_string());
                }
                let value_len = buf.get_u32() as usize;
                if buf.remaining() < value_len {
                    return Err(format!(
                        "Invalid BROADCAST: expected {} value bytes, got {}",
                        value_len,
                        buf.remaining()
                    ));
                }
                let value = buf.copy_to_bytes(value_len);
                Ok(ClusterMessage::Broadcast { topic, key, value })
            }
            _ => Err(format!("Unknown message type: 0x{:02X}", tag)),
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_str(buf: &mut Bytes, field: &str) -> Result<String, String> {
    if buf.remaining() < 4 {
        return Err(format!("Invalid {}: missing length", field));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(format!(
            "Invalid {}: expected {} bytes, got {}",
            field,
            len,
            buf.remaining()
        ));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|e| format!("Invalid {} UTF-8: {}", field, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_item_encode_decode() {
        let msg = ClusterMessage::InvalidateItem {
            cache_name: "c1".to_string(),
            key: "k1".to_string(),
            partition: Some("p1".to_string()),
        };
        let decoded = ClusterMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_invalidate_item_without_partition() {
        let msg = ClusterMessage::InvalidateItem {
            cache_name: "entities".to_string(),
            key: "user:42".to_string(),
            partition: None,
        };
        let decoded = ClusterMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_invalidate_all_encode_decode() {
        let msg = ClusterMessage::InvalidateAll {
            cache_name: "query-results".to_string(),
        };
        let decoded = ClusterMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_broadcast_encode_decode() {
        let msg = ClusterMessage::Broadcast {
            topic: "settings".to_string(),
            key: "theme".to_string(),
            value: Bytes::from("dark"),
        };
        let decoded = ClusterMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_rejects_empty_buffer() {
        assert!(ClusterMessage::decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let err = ClusterMessage::decode(Bytes::from_static(&[0xFF])).unwrap_err();
        assert!(err.contains("Unknown message type"));
    }

    #[test]
    fn test_decode_rejects_truncated_message() {
        let msg = ClusterMessage::InvalidateItem {
            cache_name: "c1".to_string(),
            key: "k1".to_string(),
            partition: Some("p1".to_string()),
        };
        let encoded = msg.encode();
        let truncated = encoded.slice(0..encoded.len() - 2);
        assert!(ClusterMessage::decode(truncated).is_err());
    }
}
