//! Message envelope definitions and serialization.
//!
//! This module defines the wire unit exchanged between nodes: one JSON object
//! per newline-terminated line. JSON string escaping guarantees an encoded
//! envelope never contains a raw newline, so a byte stream of envelopes can be
//! re-segmented by splitting on `\n`.

use crate::utils::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum encoded envelope size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = crate::MAX_MESSAGE_SIZE;

/// Kind of envelope, carried in the `type` field on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Connection metadata; `sender` carries the remote display name
    Info,
    /// Liveness ping with no payload
    Heartbeat,
    /// Chat text
    Text,
    /// File transfer announcement; `filename` is mandatory
    File,
    /// Diagnostic control message
    Log,
}

impl MessageKind {
    /// Wire name of this kind
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Heartbeat => "heartbeat",
            Self::Text => "text",
            Self::File => "file",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "heartbeat" => Ok(Self::Heartbeat),
            "text" => Ok(Self::Text),
            "file" => Ok(Self::File),
            "log" => Ok(Self::Log),
            other => Err(ProtocolError::InvalidEnvelope {
                reason: format!("unknown message kind '{other}'"),
            }),
        }
    }
}

/// One message exchanged between nodes.
///
/// Envelopes are immutable once built. Construction through [`Envelope::new`]
/// enforces that `file` envelopes carry a filename and strips the filename
/// from every other kind; [`Envelope::decode`] only checks shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    sender: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
}

impl Envelope {
    /// Build an envelope, enforcing the `file` ⇒ `filename` invariant
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidEnvelope`] when `kind` is
    /// [`MessageKind::File`] and `filename` is missing or empty.
    pub fn new(
        kind: MessageKind,
        sender: impl Into<String>,
        content: impl Into<String>,
        filename: Option<String>,
    ) -> Result<Self> {
        let filename = match kind {
            MessageKind::File => match filename {
                Some(name) if !name.is_empty() => Some(name),
                _ => {
                    return Err(ProtocolError::InvalidEnvelope {
                        reason: "file envelope requires a filename".to_string(),
                    }
                    .into())
                }
            },
            _ => None,
        };

        Ok(Self {
            kind,
            sender: sender.into(),
            content: content.into(),
            filename,
        })
    }

    /// Build an envelope from an untyped kind name
    ///
    /// # Errors
    ///
    /// Fails with [`ProtocolError::InvalidEnvelope`] for unknown kinds, and
    /// for anything [`Envelope::new`] rejects.
    pub fn from_parts(
        kind: &str,
        sender: impl Into<String>,
        content: impl Into<String>,
        filename: Option<String>,
    ) -> Result<Self> {
        let kind = kind.parse::<MessageKind>()?;
        Self::new(kind, sender, content, filename)
    }

    /// Connection metadata announcing the local display name
    pub fn info(sender: impl Into<String>) -> Self {
        Self::control(MessageKind::Info, sender)
    }

    /// Liveness ping
    pub fn heartbeat(sender: impl Into<String>) -> Self {
        Self::control(MessageKind::Heartbeat, sender)
    }

    /// Chat text
    pub fn text(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            sender: sender.into(),
            content: content.into(),
            filename: None,
        }
    }

    /// Diagnostic message
    pub fn log(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Log,
            sender: sender.into(),
            content: content.into(),
            filename: None,
        }
    }

    /// File announcement with an opaque payload
    ///
    /// # Errors
    ///
    /// Fails with [`ProtocolError::InvalidEnvelope`] on an empty filename.
    pub fn file(
        sender: impl Into<String>,
        filename: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self> {
        Self::new(MessageKind::File, sender, content, Some(filename.into()))
    }

    fn control(kind: MessageKind, sender: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            content: String::new(),
            filename: None,
        }
    }

    /// Envelope kind
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Sender identity (display name or address)
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Payload; empty for pure control messages
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Filename, present only on `file` envelopes
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Serialize to a single line of JSON, without the trailing newline
    ///
    /// # Errors
    ///
    /// Serialization of a well-formed envelope does not fail in practice;
    /// any serializer error surfaces as [`ProtocolError::MalformedEnvelope`].
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            ProtocolError::MalformedEnvelope {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Parse one line (with or without its trailing newline)
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedEnvelope`] for anything that is not a
    /// JSON object with a known `type` and a string `sender`, and
    /// [`ProtocolError::MessageTooLarge`] for oversized lines.
    pub fn decode(line: &str) -> Result<Self> {
        Self::decode_bytes(line.as_bytes())
    }

    /// Parse one raw frame as read off the socket.
    ///
    /// Bytes that are not UTF-8 are a [`ProtocolError::MalformedEnvelope`]
    /// like any other unparseable line.
    ///
    /// # Errors
    ///
    /// Same as [`Envelope::decode`].
    pub fn decode_bytes(frame: &[u8]) -> Result<Self> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: frame.len(),
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }

        let end = frame
            .iter()
            .rposition(|byte| !matches!(byte, b'\r' | b'\n'))
            .map_or(0, |last| last + 1);
        serde_json::from_slice(&frame[..end]).map_err(|e| {
            ProtocolError::MalformedEnvelope {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filename {
            Some(name) => write!(f, "[{}] {}: {} ({})", self.kind, self.sender, name, self.content.len()),
            None => write!(f, "[{}] {}: {}", self.kind, self.sender, self.content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::OverlayError;

    fn is_malformed(result: Result<Envelope>) -> bool {
        matches!(
            result,
            Err(OverlayError::Protocol(ProtocolError::MalformedEnvelope { .. }))
        )
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelopes = vec![
            Envelope::info("alice"),
            Envelope::heartbeat("alice"),
            Envelope::text("127.0.0.1:9001", "hello there"),
            Envelope::log("127.0.0.1:9001", "dial retry"),
            Envelope::file("127.0.0.1:9001", "notes.txt", "line one\nline two").unwrap(),
        ];

        for envelope in envelopes {
            let line = envelope.encode().unwrap();
            assert!(!line.contains('\n'), "encoded line must not contain a newline");
            assert_eq!(Envelope::decode(&line).unwrap(), envelope);
        }
    }

    #[test]
    fn test_wire_field_names() {
        let line = Envelope::text("bob", "hi").encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["type"], "text");
        assert_eq!(value["sender"], "bob");
        assert_eq!(value["content"], "hi");
        assert!(value.get("filename").is_none());
    }

    #[test]
    fn test_file_requires_filename() {
        let missing = Envelope::new(MessageKind::File, "bob", "data", None);
        assert!(matches!(
            missing,
            Err(OverlayError::Protocol(ProtocolError::InvalidEnvelope { .. }))
        ));

        let empty = Envelope::file("bob", "", "data");
        assert!(empty.is_err());
    }

    #[test]
    fn test_non_file_kinds_drop_filename() {
        let envelope =
            Envelope::new(MessageKind::Text, "bob", "hi", Some("ignored.txt".to_string())).unwrap();
        assert_eq!(envelope.filename(), None);
    }

    #[test]
    fn test_from_parts_rejects_unknown_kind() {
        let result = Envelope::from_parts("video", "bob", "", None);
        assert!(matches!(
            result,
            Err(OverlayError::Protocol(ProtocolError::InvalidEnvelope { .. }))
        ));

        let ok = Envelope::from_parts("heartbeat", "bob", "", None).unwrap();
        assert_eq!(ok.kind(), MessageKind::Heartbeat);
    }

    #[test]
    fn test_decode_malformed_input() {
        assert!(is_malformed(Envelope::decode("")));
        assert!(is_malformed(Envelope::decode("not json")));
        assert!(is_malformed(Envelope::decode("{\"type\":\"text\"")));
        assert!(is_malformed(Envelope::decode("[1,2,3]")));
        assert!(is_malformed(Envelope::decode("{\"type\":\"video\",\"sender\":\"x\"}")));
        assert!(is_malformed(Envelope::decode("{\"type\":\"text\",\"sender\":42}")));
        assert!(is_malformed(Envelope::decode("\u{0}\u{1}\u{2}")));
    }

    #[test]
    fn test_decode_bytes_rejects_invalid_utf8() {
        assert!(is_malformed(Envelope::decode_bytes(b"\xff\xfe garbage")));
        assert!(is_malformed(Envelope::decode_bytes(
            b"{\"type\":\"text\",\"sender\":\"\xff\"}"
        )));
        assert!(is_malformed(Envelope::decode_bytes(b"\r\n")));

        let envelope = Envelope::decode_bytes(b"{\"type\":\"text\",\"sender\":\"bob\",\"content\":\"hi\"}\r")
            .unwrap();
        assert_eq!(envelope.content(), "hi");
    }

    #[test]
    fn test_decode_is_structural() {
        let envelope = Envelope::decode("{\"type\":\"file\",\"sender\":\"bob\",\"content\":\"x\"}").unwrap();
        assert_eq!(envelope.kind(), MessageKind::File);
        assert_eq!(envelope.filename(), None);

        let envelope = Envelope::decode("{\"type\":\"heartbeat\",\"sender\":\"bob\"}\r\n").unwrap();
        assert_eq!(envelope.content(), "");
    }

    #[test]
    fn test_decode_rejects_oversized_line() {
        let line = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            Envelope::decode(&line),
            Err(OverlayError::Protocol(ProtocolError::MessageTooLarge { .. }))
        ));
    }

    #[test]
    fn test_kind_parsing() {
        for kind in [
            MessageKind::Info,
            MessageKind::Heartbeat,
            MessageKind::Text,
            MessageKind::File,
            MessageKind::Log,
        ] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
    }
}
