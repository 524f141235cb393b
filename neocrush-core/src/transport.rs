//! Framed transports over stdio and Unix domain sockets.
//!
//! Both variants share one contract: `read` yields `(method, content)` pairs,
//! `write` frames a serializable value, `close` makes subsequent reads return
//! end-of-stream. Writes on a single connection are serialized by a mutex;
//! reads are driven by a single task per connection.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use bytes::BytesMut;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::rpc;

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

const READ_CHUNK: usize = 64 * 1024;

pub struct Transport {
    reader: Mutex<FrameReader>,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
}

struct FrameReader {
    inner: BoxedReader,
    buf: BytesMut,
}

impl Transport {
    /// Transport over this process's stdin/stdout.
    pub fn stdio() -> Self {
        Self::from_parts(Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
    }

    /// Transport over a connected Unix socket.
    pub fn socket(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::from_parts(Box::new(read_half), Box::new(write_half))
    }

    pub fn from_parts(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: Mutex::new(FrameReader {
                inner: reader,
                buf: BytesMut::with_capacity(READ_CHUNK),
            }),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    /// Reads one frame. Returns `None` on end-of-stream or after `close`.
    pub async fn read(&self) -> Result<Option<(String, Vec<u8>)>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        loop {
            if let Some(frame) = rpc::split(&mut reader.buf)? {
                let (method, content) = rpc::decode_message(&frame)?;
                return Ok(Some((method, content)));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = reader.inner.read(&mut chunk).await?;
            if n == 0 {
                if !reader.buf.is_empty() {
                    bail!("connection closed mid-frame ({} buffered bytes)", reader.buf.len());
                }
                return Ok(None);
            }
            reader.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Serializes and writes one framed message.
    pub async fn write<T: Serialize>(&self, msg: &T) -> Result<()> {
        let frame = rpc::encode_message(msg)?;
        self.write_frame(&frame).await
    }

    /// Frames and writes raw JSON content, byte for byte.
    pub async fn write_content(&self, content: &[u8]) -> Result<()> {
        self.write_frame(&rpc::encode_content(content)).await
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport is closed");
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Transport::from_parts(Box::new(a_read), Box::new(a_write)),
            Transport::from_parts(Box::new(b_read), Box::new(b_write)),
        )
    }

    #[tokio::test]
    async fn write_then_read_preserves_method_and_content() {
        let (left, right) = pair();

        left.write(&json!({"jsonrpc": "2.0", "method": "initialized", "params": {}}))
            .await
            .unwrap();

        let (method, content) = right.read().await.unwrap().expect("one frame");
        assert_eq!(method, "initialized");
        let value: serde_json::Value = serde_json::from_slice(&content).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
    }

    #[tokio::test]
    async fn read_after_close_returns_end_of_stream() {
        let (left, right) = pair();
        left.write(&json!({"method": "x"})).await.unwrap();
        right.close();
        assert!(right.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_returns_none() {
        let (left, right) = pair();
        drop(left);
        assert!(right.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_content_passes_bytes_through() {
        let (left, right) = pair();
        let body = br#"{"method":"textDocument/didOpen","params":{}}"#;
        left.write_content(body).await.unwrap();

        let (method, content) = right.read().await.unwrap().unwrap();
        assert_eq!(method, "textDocument/didOpen");
        assert_eq!(content, body);
    }
}
