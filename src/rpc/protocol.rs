/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! JSON-RPC 2.0 envelopes and `Content-Length` framing.

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler is registered for the method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// The params could not be decoded into the method's payload type.
pub const INVALID_PARAMS: i64 = -32602;
/// The handler failed.
pub const INTERNAL_ERROR: i64 = -32603;
/// The request was cancelled by the requester.
pub const REQUEST_CANCELLED: i64 = -32800;

/// Notification used to cancel an in-flight request on the peer.
pub const CANCEL_METHOD: &str = "$/cancelRequest";

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Largest header block accepted before the blank line.
const MAX_HEADER_LEN: usize = 4096;

pub(crate) const JSONRPC_VERSION: &str = "2.0";

const fn default_null() -> Value {
    Value::Null
}

/// A request expecting exactly one response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Transport-assigned correlation id.
    pub id: RequestId,
    /// Message name.
    pub method: String,
    /// Payload.
    #[serde(default = "default_null")]
    pub params: Value,
}

/// The terminal outcome of a request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Id of the request this answers.
    pub id: Option<RequestId>,
    /// Handler return value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure, mutually exclusive with `result`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// A one-way message.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Message name.
    pub method: String,
    /// Payload.
    #[serde(default = "default_null")]
    pub params: Value,
}

/// Request id, either numeric or textual.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id (what this crate assigns).
    Number(i64),
    /// Textual id (accepted from peers).
    String(String),
}

/// Error object carried by a failed response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResponseError {
    /// One of the JSON-RPC error codes.
    pub code: i64,
    /// Human readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Params of a `$/cancelRequest` notification.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CancelParams {
    /// Id of the request to cancel.
    pub id: RequestId,
}

/// A decoded frame, classified by shape.
#[derive(Debug, Clone)]
pub enum Message {
    /// Has both `method` and `id`.
    Request(RequestMessage),
    /// Has `id` but no `method`.
    Response(ResponseMessage),
    /// Has `method` but no `id`.
    Notification(NotificationMessage),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl RequestMessage {
    /// Builds a request envelope.
    pub fn new(id: RequestId, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

impl ResponseMessage {
    /// Builds a successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Builds a failed response from an error code and message.
    pub fn failure(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self::with_error(
            id,
            ResponseError {
                code,
                message: message.into(),
                data: None,
            },
        )
    }

    /// Builds a failed response carrying `error`.
    pub fn with_error(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

impl NotificationMessage {
    /// Builds a notification envelope.
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

impl Message {
    /// Classifies a parsed JSON value as request, response or notification.
    pub fn from_value(value: Value) -> Result<Self> {
        let has_method = value.get("method").and_then(Value::as_str).is_some();
        let has_id = value.get("id").is_some();

        match (has_method, has_id) {
            (true, true) => Ok(Self::Request(
                serde_json::from_value(value).context("Malformed request")?,
            )),
            (true, false) => Ok(Self::Notification(
                serde_json::from_value(value).context("Malformed notification")?,
            )),
            (false, true) => Ok(Self::Response(
                serde_json::from_value(value).context("Malformed response")?,
            )),
            (false, false) => Err(anyhow::anyhow!("Unknown message format: {value}")),
        }
    }

    /// Serializes the envelope to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Request(r) => serde_json::to_string(r),
            Self::Response(r) => serde_json::to_string(r),
            Self::Notification(n) => serde_json::to_string(n),
        }
    }
}

/// Prefixes a body with its `Content-Length` header.
pub fn encode_frame(body: &str) -> String {
    format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
}

/// Parses one `Content-Length` framed body off the front of `buffer`.
///
/// Returns `Ok(None)` while the frame is still incomplete. A header block that
/// cannot be understood is consumed before the error is returned, so the
/// caller can keep reading. Headers longer than 4 KiB without a terminating
/// blank line are discarded along with everything buffered.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<Option<String>> {
    let Some(header_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buffer.len() > MAX_HEADER_LEN {
            let discarded = buffer.len();
            buffer.clear();
            anyhow::bail!("Frame header exceeds {MAX_HEADER_LEN} bytes ({discarded} discarded)");
        }
        return Ok(None);
    };
    let header_len = header_end + 4;

    let content_len = match parse_content_length(&buffer[..header_end]) {
        Ok(len) if len > MAX_FRAME_LEN => {
            buffer.advance(header_len);
            anyhow::bail!("Content-Length {len} exceeds the {MAX_FRAME_LEN} byte limit");
        }
        Ok(len) => len,
        Err(e) => {
            buffer.advance(header_len);
            return Err(e);
        }
    };

    if buffer.len() < header_len + content_len {
        return Ok(None);
    }

    buffer.advance(header_len);
    let message_bytes = buffer.split_to(content_len);
    let message = String::from_utf8(message_bytes.to_vec()).context("Frame body is not UTF-8")?;
    Ok(Some(message))
}

fn parse_content_length(headers: &[u8]) -> Result<usize> {
    let headers = std::str::from_utf8(headers).context("Failed to parse headers as UTF-8")?;

    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            return value.trim().parse().context("Invalid Content-Length");
        }
    }

    anyhow::bail!("Frame header is missing Content-Length")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_message() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"malloy/run"}"#;
        let mut buffer = BytesMut::from(encode_frame(body).as_str());

        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, Some(body.to_string()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_incomplete_header() {
        let mut buffer = BytesMut::from("Content-Length: 10\r\n");
        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_parse_incomplete_body() {
        let mut buffer = BytesMut::from("Content-Length: 100\r\n\r\n{\"partial\":");
        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, None);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_parse_multiple_messages() {
        let body1 = r#"{"jsonrpc":"2.0","id":1}"#;
        let body2 = r#"{"jsonrpc":"2.0","id":2}"#;
        let raw = format!("{}{}", encode_frame(body1), encode_frame(body2));
        let mut buffer = BytesMut::from(raw.as_str());

        let result1 = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result1, Some(body1.to_string()));

        let result2 = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result2, Some(body2.to_string()));

        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_case_insensitive_header() {
        let body = r#"{"test":true}"#;
        let raw = format!("content-length: {}\r\n\r\n{}", body.len(), body);
        let mut buffer = BytesMut::from(raw.as_str());

        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, Some(body.to_string()));
    }

    #[test]
    fn test_parse_missing_content_length() {
        let mut buffer = BytesMut::from("Content-Type: json\r\n\r\n{}");
        assert!(try_parse_message(&mut buffer).is_err());
        assert_eq!(&buffer[..], b"{}");
    }

    #[test]
    fn test_parse_oversized_content_length() {
        let raw = format!("Content-Length: {}\r\n\r\n{{}}", MAX_FRAME_LEN + 1);
        let mut buffer = BytesMut::from(raw.as_str());
        let err = try_parse_message(&mut buffer).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
        // Header consumed; the reader is not left waiting for the body.
        assert_eq!(&buffer[..], b"{}");
    }

    #[test]
    fn test_parse_runaway_header_is_discarded() {
        let mut buffer = BytesMut::from(vec![b'x'; MAX_HEADER_LEN + 1].as_slice());
        assert!(try_parse_message(&mut buffer).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_non_utf8_body() {
        let mut buffer = BytesMut::from(&b"Content-Length: 2\r\n\r\n\xff\xfe"[..]);
        assert!(try_parse_message(&mut buffer).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_request_id_string() {
        let json = r#"{"jsonrpc":"2.0","id":"abc-123","method":"malloy/log"}"#;
        let msg: RequestMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, RequestId::String("abc-123".to_string()));
        assert_eq!(msg.params, Value::Null);
    }

    #[test]
    fn test_classify_messages() {
        let request = serde_json::json!({"jsonrpc":"2.0","id":7,"method":"malloy/run","params":{}});
        assert!(matches!(
            Message::from_value(request).unwrap(),
            Message::Request(r) if r.id == RequestId::Number(7)
        ));

        let response = serde_json::json!({"jsonrpc":"2.0","id":7,"result":null});
        assert!(matches!(
            Message::from_value(response).unwrap(),
            Message::Response(_)
        ));

        let notification = serde_json::json!({"jsonrpc":"2.0","method":"$/cancelRequest","params":{"id":7}});
        assert!(matches!(
            Message::from_value(notification).unwrap(),
            Message::Notification(n) if n.method == CANCEL_METHOD
        ));

        assert!(Message::from_value(serde_json::json!({"jsonrpc":"2.0"})).is_err());
    }

    #[test]
    fn test_failure_response_shape() {
        let response = ResponseMessage::failure(Some(RequestId::Number(3)), METHOD_NOT_FOUND, "nope");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["code"], METHOD_NOT_FOUND);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_response_null_result() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        let msg: ResponseMessage = serde_json::from_str(json).unwrap();
        // null deserializes to None for Option<Value>
        assert!(msg.result.is_none());
        assert!(msg.error.is_none());
    }
}
