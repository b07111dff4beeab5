//! Messages, frames and their conversions
//!
//! A `Frame` is what travels on a physical connection: an opaque text or
//! binary payload already reassembled by the transport. A `Message` is what
//! handlers see and produce: either a primitive frame payload or a structured
//! JSON value. Serializers turn messages into frames, deserializers turn
//! frames into messages.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{SocketError, SocketResult};

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// Payload exchanged with the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short kind name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Message exchanged with handlers
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Primitive text payload, never passed through a serializer
    Text(String),
    /// Primitive binary payload, never passed through a serializer
    Binary(Vec<u8>),
    /// Structured payload, turned into a frame by the stage serializer
    Json(serde_json::Value),
}

impl Message {
    /// Build a structured message from any serializable value
    pub fn json<T: Serialize>(value: &T) -> SocketResult<Self> {
        Ok(Message::Json(serde_json::to_value(value)?))
    }

    /// Decode the message into a typed value
    ///
    /// Text payloads are parsed as JSON; binary payloads are not decodable.
    pub fn decode<T: DeserializeOwned>(&self) -> SocketResult<T> {
        match self {
            Message::Json(value) => Ok(T::deserialize(value)?),
            Message::Text(text) => Ok(serde_json::from_str(text)?),
            Message::Binary(_) => Err(SocketError::Serialization(
                "binary payload cannot be decoded as JSON".to_string(),
            )),
        }
    }

    /// Text payload, if this is a text message
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Raw frame for this message; JSON values are rendered compactly
    pub fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Json(value) => Frame::Text(value.to_string()),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data)
    }
}

impl From<serde_json::Value> for Message {
    fn from(value: serde_json::Value) -> Self {
        Message::Json(value)
    }
}

// ----------------------------------------------------------------------------
// Serializers
// ----------------------------------------------------------------------------

/// Turns structured outbound messages into frames
pub trait Serializer: Send + Sync {
    fn serialize(&self, message: Message) -> SocketResult<Frame>;
}

/// Turns inbound frames into messages
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, frame: Frame) -> SocketResult<Message>;
}

/// Hands frames through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Serializer for Passthrough {
    fn serialize(&self, message: Message) -> SocketResult<Frame> {
        Ok(message.into_frame())
    }
}

impl Deserializer for Passthrough {
    fn deserialize(&self, frame: Frame) -> SocketResult<Message> {
        Ok(frame.into())
    }
}

/// JSON text codec
///
/// Outbound JSON values become compact text frames. Inbound text frames are
/// parsed into `Message::Json`; binary frames are handed through.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Serializer for JsonCodec {
    fn serialize(&self, message: Message) -> SocketResult<Frame> {
        match message {
            Message::Json(value) => Ok(Frame::Text(serde_json::to_string(&value)?)),
            other => Ok(other.into_frame()),
        }
    }
}

impl Deserializer for JsonCodec {
    fn deserialize(&self, frame: Frame) -> SocketResult<Message> {
        match frame {
            Frame::Text(text) => Ok(Message::Json(serde_json::from_str(&text)?)),
            Frame::Binary(data) => Ok(Message::Binary(data)),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Subscribe {
        channel: String,
        depth: u32,
    }

    #[test]
    fn test_json_codec_text_frames() {
        let frame = JsonCodec
            .serialize(Message::json(&Subscribe {
                channel: "trades".into(),
                depth: 10,
            })
            .unwrap())
            .unwrap();
        assert_eq!(frame, Frame::Text(r#"{"channel":"trades","depth":10}"#.into()));

        let message = JsonCodec.deserialize(frame).unwrap();
        let decoded: Subscribe = message.decode().unwrap();
        assert_eq!(decoded.depth, 10);
    }

    #[test]
    fn test_json_codec_rejects_invalid_text() {
        let err = JsonCodec
            .deserialize(Frame::Text("not json".into()))
            .unwrap_err();
        assert!(matches!(err, SocketError::Serialization(_)));
    }

    #[test]
    fn test_passthrough_keeps_primitives() {
        assert_eq!(
            Passthrough.deserialize(Frame::Binary(vec![1, 2])).unwrap(),
            Message::Binary(vec![1, 2])
        );
        assert_eq!(
            Passthrough.serialize(json!({"a": 1}).into()).unwrap(),
            Frame::Text(r#"{"a":1}"#.into())
        );
    }

    #[test]
    fn test_decode_binary_fails() {
        let err = Message::Binary(vec![0]).decode::<u32>().unwrap_err();
        assert!(matches!(err, SocketError::Serialization(_)));
    }
}
