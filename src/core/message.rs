use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique name of a point-to-point queue within a [`QueueRegistry`].
///
/// [`QueueRegistry`]: crate::core::queue::registry::QueueRegistry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName(pub String);

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        QueueName(s.to_owned())
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        QueueName(s)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for QueueName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Name of a publish/subscribe topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(pub String);

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicName {
    fn from(s: &str) -> Self {
        TopicName(s.to_owned())
    }
}

impl From<String> for TopicName {
    fn from(s: String) -> Self {
        TopicName(s)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for TopicName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Identity of the principal that enqueued a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity(pub String);

impl fmt::Display for SenderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SenderIdentity {
    fn from(s: &str) -> Self {
        SenderIdentity(s.to_owned())
    }
}

// Well-known header keys. Unknown keys round-trip untouched.
const HDR_MESSAGE_ID: &str = "message-id";
const HDR_DESTINATION: &str = "destination";
const HDR_CONTENT_TYPE: &str = "content-type";
const HDR_EXPIRES: &str = "expires";
const HDR_SENT: &str = "sent";

/// Map-backed message headers with typed accessors for the well-known keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders(HashMap<String, String>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get(HDR_MESSAGE_ID)
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.set(HDR_MESSAGE_ID, id);
    }

    pub fn destination(&self) -> Option<&str> {
        self.get(HDR_DESTINATION)
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.set(HDR_DESTINATION, destination);
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(HDR_CONTENT_TYPE)
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set(HDR_CONTENT_TYPE, content_type);
    }

    /// Absolute expiration in milliseconds since epoch, if set.
    pub fn expires_ms(&self) -> Option<u64> {
        self.get(HDR_EXPIRES).and_then(|v| v.parse().ok())
    }

    pub fn set_expires_ms(&mut self, expires_ms: u64) {
        self.set(HDR_EXPIRES, expires_ms.to_string());
    }

    /// Milliseconds-since-epoch timestamp recorded when the message was built.
    pub fn sent_ms(&self) -> Option<u64> {
        self.get(HDR_SENT).and_then(|v| v.parse().ok())
    }

    pub fn set_sent_ms(&mut self, sent_ms: u64) {
        self.set(HDR_SENT, sent_ms.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A producer-facing message: headers plus an opaque body.
///
/// Body serialization and content-type negotiation live outside the core;
/// the engine only moves bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub headers: MessageHeaders,
    pub body: Bytes,
}

impl Message {
    /// Builds a message with a fresh unique id and a `sent` timestamp.
    pub fn new(body: impl Into<Bytes>) -> Self {
        let mut headers = MessageHeaders::new();
        headers.set_message_id(Uuid::new_v4().to_string());
        headers.set_sent_ms(current_timestamp());
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn with_headers(headers: MessageHeaders, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Unique message id. Every message built through [`Message::new`] has one.
    pub fn id(&self) -> &str {
        self.headers.message_id().unwrap_or("")
    }

    /// Whether the message's TTL has lapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.headers.expires_ms() {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_message_has_id_and_sent_timestamp() {
        let msg = Message::new("hello");
        assert!(!msg.id().is_empty());
        assert!(msg.headers.sent_ms().is_some());
        assert_eq!(msg.body, Bytes::from("hello"));
    }

    #[test]
    fn expiry_is_read_from_headers() {
        let mut msg = Message::new("x");
        assert!(!msg.is_expired(current_timestamp()));

        msg.headers.set_expires_ms(1);
        assert!(msg.is_expired(current_timestamp()));
    }

    #[test]
    fn unknown_headers_are_preserved() {
        let mut headers = MessageHeaders::new();
        headers.set("x-custom", "42");
        let msg = Message::with_headers(headers, "body");
        assert_eq!(msg.headers.get("x-custom"), Some("42"));
    }
}
