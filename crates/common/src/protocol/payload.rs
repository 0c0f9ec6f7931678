use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Payload slot (`"4"`) of a control record
///
/// Text is only used for metadata (the local address announcement and the token
/// assignment). Stream bytes always travel in the binary shape
/// `{"type":"Buffer","data":[...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Binary(BufferPayload),
}

/// Binary chunk encoded as a list of byte values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPayload {
    #[serde(rename = "type")]
    pub kind: BufferKind,
    pub data: Vec<u8>,
}

/// The only accepted value of the `type` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferKind {
    Buffer,
}

impl Payload {
    pub fn text(value: impl Into<String>) -> Self {
        Payload::Text(value.into())
    }

    pub fn binary(data: &[u8]) -> Self {
        Payload::Binary(BufferPayload {
            kind: BufferKind::Buffer,
            data: data.to_vec(),
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    /// Stream bytes, never derived from a text payload
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Payload::Binary(buffer) => Some(Bytes::from(buffer.data)),
            Payload::Text(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_payload_shape() {
        let payload = Payload::binary(b"hi");
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"type":"Buffer","data":[104,105]}"#);
    }

    #[test]
    fn test_text_payload_shape() {
        let payload = Payload::text("127.0.0.1:8080");
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#""127.0.0.1:8080""#);
    }

    #[test]
    fn test_parse_node_buffer() {
        let parsed: Payload =
            serde_json::from_str(r#"{"type":"Buffer","data":[0,1,2,255]}"#).unwrap();
        assert_eq!(
            parsed.into_bytes().unwrap(),
            Bytes::from_static(&[0, 1, 2, 255])
        );
    }

    #[test]
    fn test_text_is_never_stream_bytes() {
        let parsed: Payload = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(parsed.as_text(), Some("hello"));
        assert!(parsed.into_bytes().is_none());
    }

    #[test]
    fn test_rejects_unknown_buffer_type() {
        let parsed = serde_json::from_str::<Payload>(r#"{"type":"Blob","data":[1]}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_rejects_out_of_range_byte() {
        let parsed = serde_json::from_str::<Payload>(r#"{"type":"Buffer","data":[256]}"#);
        assert!(parsed.is_err());
    }
}
