//! LSP wire framing: `Content-Length: N\r\n\r\n` followed by N bytes of JSON.
//!
//! All three peers (editor, agent, tool clients) speak this framing on the
//! daemon socket, so the codec is shared by every transport.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum payload size for a single frame.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH_PREFIX: &[u8] = b"Content-Length: ";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("frame header is not `Content-Length: <n>`")]
    MalformedHeader,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// The minimal envelope needed to route an incoming message.
/// A JSON-RPC response carries no `method`, which decodes to an empty string.
#[derive(Debug, Deserialize)]
struct BaseMessage {
    #[serde(default)]
    method: String,
}

/// Serializes a message to wire format with the Content-Length header.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, RpcError> {
    let content = serde_json::to_vec(msg)?;
    Ok(encode_content(&content))
}

/// Frames already-serialized JSON content.
pub fn encode_content(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 32);
    out.extend_from_slice(CONTENT_LENGTH_PREFIX);
    out.extend_from_slice(content.len().to_string().as_bytes());
    out.extend_from_slice(HEADER_SEPARATOR);
    out.extend_from_slice(content);
    out
}

/// Extracts the method name and JSON content from a complete frame.
pub fn decode_message(frame: &[u8]) -> Result<(String, Vec<u8>), RpcError> {
    let separator = find_separator(frame).ok_or(RpcError::MalformedHeader)?;
    let header = &frame[..separator];
    let content_length = parse_content_length(header)?;

    let body = &frame[separator + HEADER_SEPARATOR.len()..];
    if body.len() < content_length {
        return Err(RpcError::MalformedHeader);
    }
    let content = &body[..content_length];

    let base: BaseMessage = serde_json::from_slice(content)?;
    Ok((base.method, content.to_vec()))
}

/// Splits one complete frame off the front of `buf`, consuming it.
/// Returns `None` while more bytes are needed.
pub fn split(buf: &mut BytesMut) -> Result<Option<BytesMut>, RpcError> {
    let Some(separator) = find_separator(buf) else {
        // A header this long will never become valid.
        if buf.len() > 4096 {
            return Err(RpcError::MalformedHeader);
        }
        return Ok(None);
    };

    let content_length = parse_content_length(&buf[..separator])?;
    if content_length > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(content_length));
    }

    let total = separator + HEADER_SEPARATOR.len() + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some(buf.split_to(total)))
}

fn find_separator(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_SEPARATOR.len())
        .position(|w| w == HEADER_SEPARATOR)
}

fn parse_content_length(header: &[u8]) -> Result<usize, RpcError> {
    let digits = header
        .strip_prefix(CONTENT_LENGTH_PREFIX)
        .ok_or(RpcError::MalformedHeader)?;
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or(RpcError::MalformedHeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_then_decode_round_trips() {
        let msg = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "textDocument/didOpen",
            "params": {"textDocument": {"uri": "file:///a.txt"}}
        });

        let frame = encode_message(&msg).unwrap();
        let (method, content) = decode_message(&frame).unwrap();

        assert_eq!(method, "textDocument/didOpen");
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&content).unwrap(), msg);
    }

    #[test]
    fn response_without_method_decodes_to_empty() {
        let frame = encode_message(&json!({"jsonrpc": "2.0", "id": 7, "result": null})).unwrap();
        let (method, _) = decode_message(&frame).unwrap();
        assert_eq!(method, "");
    }

    #[test]
    fn split_waits_for_full_frame() {
        let frame = encode_message(&json!({"method": "x"})).unwrap();

        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(split(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let complete = split(&mut buf).unwrap().expect("frame complete");
        assert_eq!(&complete[..], &frame[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_waits_for_header() {
        let mut buf = BytesMut::from(&b"Content-Len"[..]);
        assert!(split(&mut buf).unwrap().is_none());
    }

    #[test]
    fn split_consumes_only_one_frame() {
        let first = encode_message(&json!({"method": "a"})).unwrap();
        let second = encode_message(&json!({"method": "b"})).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        let frame = split(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &first[..]);
        assert_eq!(&buf[..], &second[..]);
    }

    #[test]
    fn split_rejects_malformed_header() {
        let mut buf = BytesMut::from(&b"Content-Type: nope\r\n\r\n{}"[..]);
        assert!(matches!(split(&mut buf), Err(RpcError::MalformedHeader)));
    }

    #[test]
    fn split_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("Content-Length: {}\r\n\r\n", MAX_FRAME_SIZE + 1).as_bytes());
        assert!(matches!(split(&mut buf), Err(RpcError::FrameTooLarge(_))));
    }

    #[test]
    fn decode_rejects_truncated_json() {
        let frame = b"Content-Length: 10\r\n\r\n{\"method\":";
        assert!(decode_message(frame).is_err());
    }
}
