//! JSON codec for the control channel

use thiserror::Error;

use crate::messages::{ControlMessage, ForwardResponse, WireResponse};

#[derive(Debug, Error)]
pub enum CodecError {
    /// Text was not valid JSON for the expected shape
    #[error("Invalid response format: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid response: Missing fields ({0})")]
    MissingField(&'static str),
}

/// Stateless encoder/decoder for control-channel text frames
pub struct ControlCodec;

impl ControlCodec {
    /// Encode a broker → agent message to its JSON text form
    pub fn encode(msg: &ControlMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Decode a broker → agent message (used by agents and tests)
    pub fn decode_message(text: &str) -> Result<ControlMessage, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode an agent reply. `requestId`, `status` and `responseType` are required;
    /// a missing `body` decodes as the empty string.
    pub fn decode_response(text: &str) -> Result<ForwardResponse, CodecError> {
        let wire: WireResponse = serde_json::from_str(text)?;
        ForwardResponse::try_from(wire)
    }

    /// Encode an agent reply (used by agents and tests)
    pub fn encode_response(response: &ForwardResponse) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&WireResponse::from(response.clone()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ForwardRequest, ResponseKind};

    #[test]
    fn test_decode_minimal_response() {
        let text = r#"{"requestId":"abc","status":200,"responseType":"RESPONSE"}"#;
        let response = ControlCodec::decode_response(text).unwrap();

        assert_eq!(response.request_id, "abc");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "");
        assert_eq!(response.kind, ResponseKind::Normal);
    }

    #[test]
    fn test_decode_chunk_response() {
        let text = r#"{"requestId":"abc","status":200,"body":"part","last":true,"responseType":"RESPONSE_CHUNK","headers":{"X-A":"1"}}"#;
        let response = ControlCodec::decode_response(text).unwrap();

        assert_eq!(response.kind, ResponseKind::Chunk);
        assert!(response.last);
        assert_eq!(response.headers.get("X-A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_missing_fields() {
        let text = r#"{"status":200,"responseType":"RESPONSE"}"#;
        let err = ControlCodec::decode_response(text).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("requestId")));
        assert!(err.to_string().starts_with("Invalid response: Missing fields"));

        let text = r#"{"requestId":"abc","status":200}"#;
        let err = ControlCodec::decode_response(text).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("responseType")));
    }

    #[test]
    fn test_garbage_is_format_error() {
        let err = ControlCodec::decode_response("not json at all").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
        assert!(err.to_string().starts_with("Invalid response format"));
    }

    #[test]
    fn test_message_round_trip() {
        let msg = ControlMessage::forward(
            "id-9",
            ForwardRequest::new("GET", "/health").with_header("Accept", "*/*"),
        );
        let text = ControlCodec::encode(&msg).unwrap();
        assert_eq!(ControlCodec::decode_message(&text).unwrap(), msg);
    }

    #[test]
    fn test_response_round_trip() {
        let response = ForwardResponse::new("id-1", 404, "missing").with_header("X-B", "2");
        let text = ControlCodec::encode_response(&response).unwrap();
        assert_eq!(ControlCodec::decode_response(&text).unwrap(), response);
    }
}
