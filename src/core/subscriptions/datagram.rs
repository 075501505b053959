//! Binary wire format for subscription change announcements.
//!
//! Layout, in order:
//! node-id (8) · type tag (1, always 243) · action (1) · TTL seconds
//! (4, big-endian i32) · topic (UTF-8) · NUL · subscriber URI (UTF-8) · NUL.
//!
//! The wire boundary is explicit: [`SubscriptionDatagram::encode`] and
//! [`SubscriptionDatagram::decode`] are the only conversions.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

use crate::core::error::{BusError, BusResult};
use crate::core::message::TopicName;

/// First byte after the node id; identifies a subscription datagram.
const TYPE_ID: u8 = 243;
const NULL_TERMINATOR: u8 = 0;

const TYPE_ID_LEN: usize = 1;
const ACTION_LEN: usize = 1;
const TTL_LEN: usize = 4;
const TERMINATOR_LEN: usize = 1;

const MIN_TOPIC_LEN: usize = 1;
// Shortest plausible subscriber URI ("http://" prefix).
const MIN_URI_LEN: usize = 7;

const MIN_LEN: usize = NodeId::LEN
    + TYPE_ID_LEN
    + ACTION_LEN
    + TTL_LEN
    + MIN_TOPIC_LEN
    + TERMINATOR_LEN
    + MIN_URI_LEN
    + TERMINATOR_LEN;

/// Fixed-width identifier distinguishing the originating node of a datagram,
/// used to suppress application of a node's own broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NodeId::LEN]);

impl NodeId {
    pub const LEN: usize = 8;

    /// Generates a process-unique node id.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&uuid.as_bytes()[..Self::LEN]);
        NodeId(bytes)
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        NodeId(bytes)
    }

    /// Parses the hex form produced by `Display` (16 hex characters).
    pub fn parse_hex(s: &str) -> BusResult<Self> {
        let raw = s.as_bytes();
        if raw.len() != Self::LEN * 2 {
            return Err(BusError::Transport(format!(
                "node id must be {} hex characters, got {}",
                Self::LEN * 2,
                raw.len()
            )));
        }
        let mut bytes = [0u8; Self::LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = std::str::from_utf8(&raw[i * 2..i * 2 + 2])
                .map_err(|_| BusError::Transport("node id is not valid hex".into()))?;
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| BusError::Transport("node id is not valid hex".into()))?;
        }
        Ok(NodeId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Subscription mutation carried by a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionAction {
    Add = 0,
    Remove = 1,
}

impl SubscriptionAction {
    fn from_byte(b: u8) -> BusResult<Self> {
        match b {
            0 => Ok(SubscriptionAction::Add),
            1 => Ok(SubscriptionAction::Remove),
            other => Err(BusError::DatagramDecode(format!(
                "unknown action byte {other}"
            ))),
        }
    }
}

/// A subscription change announcement. Exists only on the wire; nodes apply
/// decoded datagrams to their local registry and never relay them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDatagram {
    pub node_id: NodeId,
    pub action: SubscriptionAction,
    /// TTL in whole seconds; 0 (or negative) means the subscription never
    /// expires.
    pub ttl_secs: i32,
    pub topic: TopicName,
    pub subscriber_uri: String,
}

impl SubscriptionDatagram {
    /// Encodes into an exact-size buffer; no padding.
    pub fn encode(&self) -> Bytes {
        let topic = self.topic.as_bytes();
        let uri = self.subscriber_uri.as_bytes();
        let len = NodeId::LEN
            + TYPE_ID_LEN
            + ACTION_LEN
            + TTL_LEN
            + topic.len()
            + TERMINATOR_LEN
            + uri.len()
            + TERMINATOR_LEN;

        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(self.node_id.as_bytes());
        buf.put_u8(TYPE_ID);
        buf.put_u8(self.action as u8);
        buf.put_i32(self.ttl_secs);
        buf.put_slice(topic);
        buf.put_u8(NULL_TERMINATOR);
        buf.put_slice(uri);
        buf.put_u8(NULL_TERMINATOR);
        buf.freeze()
    }

    /// Decodes wire bytes, validating length, type tag and both terminators.
    pub fn decode(buffer: &[u8]) -> BusResult<Self> {
        if buffer.len() < MIN_LEN {
            return Err(BusError::DatagramDecode(format!(
                "buffer must be at least {MIN_LEN} bytes, got {}",
                buffer.len()
            )));
        }

        let mut off = 0;
        let mut node_bytes = [0u8; NodeId::LEN];
        node_bytes.copy_from_slice(&buffer[..NodeId::LEN]);
        let node_id = NodeId::from_bytes(node_bytes);
        off += NodeId::LEN;

        let type_id = buffer[off];
        if type_id != TYPE_ID {
            return Err(BusError::DatagramDecode(format!(
                "incorrect type tag {type_id}"
            )));
        }
        off += TYPE_ID_LEN;

        let action = SubscriptionAction::from_byte(buffer[off])?;
        off += ACTION_LEN;

        let ttl_secs = i32::from_be_bytes(
            buffer[off..off + TTL_LEN]
                .try_into()
                .expect("slice has TTL_LEN bytes"),
        );
        off += TTL_LEN;

        let topic_end = find_terminator(buffer, off)
            .ok_or_else(|| BusError::DatagramDecode("missing terminator for topic".into()))?;
        let topic = str_field(&buffer[off..topic_end], "topic")?;
        off = topic_end + TERMINATOR_LEN;

        let uri_end = find_terminator(buffer, off).ok_or_else(|| {
            BusError::DatagramDecode("missing terminator for subscriber URI".into())
        })?;
        let subscriber_uri = str_field(&buffer[off..uri_end], "subscriber URI")?;

        Ok(SubscriptionDatagram {
            node_id,
            action,
            ttl_secs,
            topic: TopicName(topic),
            subscriber_uri,
        })
    }
}

fn find_terminator(buffer: &[u8], from: usize) -> Option<usize> {
    buffer[from..]
        .iter()
        .position(|&b| b == NULL_TERMINATOR)
        .map(|pos| from + pos)
}

fn str_field(bytes: &[u8], field: &str) -> BusResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| BusError::DatagramDecode(format!("{field} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(action: SubscriptionAction, ttl_secs: i32) -> SubscriptionDatagram {
        SubscriptionDatagram {
            node_id: NodeId::generate(),
            action,
            ttl_secs,
            topic: TopicName::from("orders"),
            subscriber_uri: "http://node-b:8080/bus".to_string(),
        }
    }

    #[test]
    fn node_id_hex_round_trip() {
        let id = NodeId::generate();
        assert_eq!(NodeId::parse_hex(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn node_id_rejects_bad_hex() {
        assert!(NodeId::parse_hex("not-hex!").is_err());
        assert!(NodeId::parse_hex("00112233aabbccd").is_err());
        assert!(NodeId::parse_hex("zz112233aabbccdd").is_err());
    }

    #[test]
    fn round_trip_add() {
        let datagram = sample(SubscriptionAction::Add, 300);
        let decoded = SubscriptionDatagram::decode(&datagram.encode()).unwrap();
        assert_eq!(decoded, datagram);
    }

    #[test]
    fn round_trip_remove_with_zero_ttl() {
        let datagram = sample(SubscriptionAction::Remove, 0);
        let decoded = SubscriptionDatagram::decode(&datagram.encode()).unwrap();
        assert_eq!(decoded, datagram);
    }

    #[test]
    fn round_trip_negative_ttl() {
        let datagram = sample(SubscriptionAction::Add, -1);
        let decoded = SubscriptionDatagram::decode(&datagram.encode()).unwrap();
        assert_eq!(decoded.ttl_secs, -1);
    }

    #[test]
    fn encoded_length_is_exact() {
        let datagram = sample(SubscriptionAction::Add, 60);
        let bytes = datagram.encode();
        let expected = NodeId::LEN + 1 + 1 + 4 + "orders".len() + 1 + datagram.subscriber_uri.len() + 1;
        assert_eq!(bytes.len(), expected);
    }

    #[test]
    fn decode_rejects_empty_buffer() {
        assert!(matches!(
            SubscriptionDatagram::decode(&[]),
            Err(BusError::DatagramDecode(_))
        ));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let bytes = sample(SubscriptionAction::Add, 1).encode();
        assert!(matches!(
            SubscriptionDatagram::decode(&bytes[..MIN_LEN - 1]),
            Err(BusError::DatagramDecode(_))
        ));
    }

    #[test]
    fn decode_rejects_wrong_type_tag() {
        let mut bytes = sample(SubscriptionAction::Add, 1).encode().to_vec();
        bytes[NodeId::LEN] = 42;
        assert!(matches!(
            SubscriptionDatagram::decode(&bytes),
            Err(BusError::DatagramDecode(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_topic_terminator() {
        let mut bytes = sample(SubscriptionAction::Add, 1).encode().to_vec();
        // Overwrite every NUL so neither field is bounded.
        for b in bytes.iter_mut() {
            if *b == 0 {
                *b = b'x';
            }
        }
        assert!(matches!(
            SubscriptionDatagram::decode(&bytes),
            Err(BusError::DatagramDecode(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_uri_terminator() {
        let datagram = sample(SubscriptionAction::Add, 1);
        let bytes = datagram.encode();
        // Drop the trailing URI terminator but keep the length valid by
        // appending non-NUL padding.
        let mut truncated = bytes[..bytes.len() - 1].to_vec();
        truncated.extend_from_slice(b"xxxx");
        assert!(matches!(
            SubscriptionDatagram::decode(&truncated),
            Err(BusError::DatagramDecode(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_action() {
        let mut bytes = sample(SubscriptionAction::Add, 1).encode().to_vec();
        bytes[NodeId::LEN + 1] = 9;
        assert!(matches!(
            SubscriptionDatagram::decode(&bytes),
            Err(BusError::DatagramDecode(_))
        ));
    }
}
