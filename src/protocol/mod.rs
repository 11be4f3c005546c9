//! Wire encoding of partition requests and replies
//!
//! Every payload is a self-describing JSON frame:
//!
//! ```json
//! {"format": "brokermr", "version": 1, "kind": "partition_request", "body": {...}}
//! ```
//!
//! Decoding checks the frame header before touching the body so a payload
//! from an incompatible producer fails with a precise error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::Correlation;
use crate::error::{ErrorCode, ErrorExt, MapReduceError, MapReduceResult};
use crate::source::SourceFactory;

pub const WIRE_FORMAT: &str = "brokermr";
pub const WIRE_VERSION: u32 = 1;

/// Message kinds carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    PartitionRequest,
    PartitionReply,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PartitionRequest => "partition_request",
            Self::PartitionReply => "partition_reply",
        }
    }
}

/// One unit of work: a partition of the dataset for one computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRequest {
    /// Run the partition belongs to
    pub run_id: Uuid,
    /// Position of the partial result in the final reduce
    pub sequence_index: u32,
    /// Computation identity; workers reject requests for another computation
    pub computation: String,
    /// Descriptor of the partition's data
    pub factory: SourceFactory,
}

impl PartitionRequest {
    pub fn correlation(&self) -> Correlation {
        Correlation::new(self.run_id, self.sequence_index)
    }
}

/// A worker's partial result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReply {
    pub partial: Value,
}

#[derive(Serialize)]
struct FrameOut<'a, T> {
    format: &'a str,
    version: u32,
    kind: &'a str,
    body: &'a T,
}

#[derive(Deserialize)]
struct FrameIn {
    format: String,
    version: u32,
    kind: String,
    body: Value,
}

fn encode<T: Serialize>(kind: MessageKind, body: &T) -> MapReduceResult<Vec<u8>> {
    let frame = FrameOut {
        format: WIRE_FORMAT,
        version: WIRE_VERSION,
        kind: kind.as_str(),
        body,
    };
    serde_json::to_vec(&frame).to_encode_error(format!("Cannot encode {}", kind.as_str()))
}

fn decode<T: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> MapReduceResult<T> {
    let frame: FrameIn = serde_json::from_slice(payload).to_decode_error("Payload is not a brokermr frame")?;

    if frame.format != WIRE_FORMAT {
        return Err(MapReduceError::decode_with_code(
            ErrorCode::DECODE_MALFORMED,
            format!("Unknown wire format '{}'", frame.format),
        ));
    }
    if frame.version != WIRE_VERSION {
        return Err(MapReduceError::decode_with_code(
            ErrorCode::DECODE_UNSUPPORTED_VERSION,
            format!(
                "Wire version {} is not supported (expected {})",
                frame.version, WIRE_VERSION
            ),
        ));
    }
    if frame.kind != kind.as_str() {
        return Err(MapReduceError::decode_with_code(
            ErrorCode::DECODE_UNEXPECTED_KIND,
            format!("Expected {}, got '{}'", kind.as_str(), frame.kind),
        ));
    }

    serde_json::from_value(frame.body)
        .to_decode_error(format!("Malformed {} body", kind.as_str()))
}

pub fn encode_request(request: &PartitionRequest) -> MapReduceResult<Vec<u8>> {
    encode(MessageKind::PartitionRequest, request)
}

pub fn decode_request(payload: &[u8]) -> MapReduceResult<PartitionRequest> {
    decode(MessageKind::PartitionRequest, payload)
}

pub fn encode_reply(reply: &PartitionReply) -> MapReduceResult<Vec<u8>> {
    encode(MessageKind::PartitionReply, reply)
}

pub fn decode_reply(payload: &[u8]) -> MapReduceResult<PartitionReply> {
    decode(MessageKind::PartitionReply, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> PartitionRequest {
        PartitionRequest {
            run_id: Uuid::new_v4(),
            sequence_index: 3,
            computation: "sum_of_squares".to_string(),
            factory: SourceFactory::inline(vec![json!(1), json!(2)]),
        }
    }

    #[test]
    fn test_request_frame_header() {
        let bytes = encode_request(&request()).unwrap();
        let frame: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(frame["format"], "brokermr");
        assert_eq!(frame["version"], 1);
        assert_eq!(frame["kind"], "partition_request");
        assert_eq!(frame["body"]["sequence_index"], 3);
    }

    #[test]
    fn test_request_decodes() {
        let original = request();
        let decoded = decode_request(&encode_request(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.correlation().sequence_index, 3);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let payload = json!({
            "format": "brokermr",
            "version": 2,
            "kind": "partition_reply",
            "body": {"partial": 1}
        });
        let err = decode_reply(&serde_json::to_vec(&payload).unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DECODE_UNSUPPORTED_VERSION);
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let bytes = encode_reply(&PartitionReply { partial: json!(4) }).unwrap();
        let err = decode_request(&bytes).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DECODE_UNEXPECTED_KIND);
    }

    #[test]
    fn test_rejects_foreign_format_and_garbage() {
        let payload = json!({"format": "pickle", "version": 1, "kind": "partition_reply", "body": {}});
        let err = decode_reply(&serde_json::to_vec(&payload).unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DECODE_MALFORMED);

        let err = decode_reply(b"\x80\x04garbage").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DECODE_MALFORMED);
    }

    #[test]
    fn test_rejects_malformed_body() {
        let payload = json!({
            "format": "brokermr",
            "version": 1,
            "kind": "partition_request",
            "body": {"run_id": "not-a-uuid"}
        });
        let err = decode_request(&serde_json::to_vec(&payload).unwrap()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
