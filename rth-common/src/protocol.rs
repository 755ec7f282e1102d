//! Framed wire protocol between the controller and a worker process.
//!
//! The transport is a loopback TCP stream. Every frame starts with a one-byte
//! op code. Strings are a 16-bit big-endian length followed by UTF-8 bytes;
//! lists and sets are a 16-bit count followed by that many strings; maps a
//! 16-bit count followed by key/value pairs. Frames are assembled in full
//! before being written, so a frame can never interleave with another writer
//! sharing the stream.
//!
//! Controller to worker: DO_COMPILE, DO_MAIN, CLOSE (plus KEEPALIVE probes).
//! Worker to controller: OUTPUT, STATUS (terminal), KEEPALIVE. Any other op
//! byte is a protocol violation fatal to the channel.

use crate::action::{CompileAction, MainAction};
use crate::status::{Status, StatusKind};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Wire op codes. One namespace for both directions.
pub mod op {
    pub const DO_COMPILE: u8 = 1;
    pub const DO_MAIN: u8 = 2;
    pub const CLOSE: u8 = 3;
    pub const OUTPUT: u8 = 4;
    pub const STATUS: u8 = 5;
    pub const KEEPALIVE: u8 = 6;
}

/// Stream name whose chunks belong in the primary message log rather than a
/// side-channel output buffer.
pub const MESSAGE_STREAM: &str = "messages";
/// Stream name for a test program's standard output.
pub const STDOUT_STREAM: &str = "stdout";
/// Stream name for a test program's standard error.
pub const STDERR_STREAM: &str = "stderr";

/// Upper bound on one string field or collection, from the 16-bit counts.
pub const MAX_FIELD: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o on worker channel: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown op byte 0x{0:02x}")]
    UnknownOp(u8),
    #[error("unknown status type byte 0x{0:02x}")]
    UnknownStatus(u8),
    #[error("string field exceeds 16-bit length ({0} bytes)")]
    FieldTooLarge(usize),
    #[error("collection exceeds 16-bit count ({0} entries)")]
    CollectionTooLarge(usize),
    #[error("string field is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// A controller-to-worker frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Compile(CompileAction),
    Main(MainAction),
    Close,
    KeepAlive,
}

/// A worker-to-controller frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Output { stream: String, data: String },
    Status(Status),
    KeepAlive,
}

// ── Encoding ────────────────────────────────────────────────────────────────

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_FIELD {
        return Err(ProtocolError::FieldTooLarge(bytes.len()));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_count(buf: &mut Vec<u8>, count: usize) -> Result<(), ProtocolError> {
    if count > MAX_FIELD {
        return Err(ProtocolError::CollectionTooLarge(count));
    }
    buf.extend_from_slice(&(count as u16).to_be_bytes());
    Ok(())
}

fn put_list(buf: &mut Vec<u8>, items: &[String]) -> Result<(), ProtocolError> {
    put_count(buf, items.len())?;
    for item in items {
        put_str(buf, item)?;
    }
    Ok(())
}

fn put_set(buf: &mut Vec<u8>, items: &BTreeSet<String>) -> Result<(), ProtocolError> {
    put_count(buf, items.len())?;
    for item in items {
        put_str(buf, item)?;
    }
    Ok(())
}

fn put_map(buf: &mut Vec<u8>, map: &BTreeMap<String, String>) -> Result<(), ProtocolError> {
    put_count(buf, map.len())?;
    for (key, value) in map {
        put_str(buf, key)?;
        put_str(buf, value)?;
    }
    Ok(())
}

/// Writes whole frames to the underlying stream, flushing after each one.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(256),
        }
    }

    /// Give the underlying stream back, discarding the frame buffer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    pub async fn write_request(&mut self, request: &Request) -> Result<(), ProtocolError> {
        self.buf.clear();
        match request {
            Request::Compile(compile) => {
                self.buf.push(op::DO_COMPILE);
                put_str(&mut self.buf, &compile.test_name)?;
                put_map(&mut self.buf, &compile.properties)?;
                put_list(&mut self.buf, &compile.args)?;
            }
            Request::Main(main) => {
                self.buf.push(op::DO_MAIN);
                put_str(&mut self.buf, &main.test_name)?;
                put_map(&mut self.buf, &main.properties)?;
                put_set(&mut self.buf, &main.add_exports)?;
                put_set(&mut self.buf, &main.add_opens)?;
                put_set(&mut self.buf, &main.add_modules)?;
                put_str(&mut self.buf, &main.class_path)?;
                put_str(&mut self.buf, &main.module_path)?;
                put_str(&mut self.buf, &main.entry_point)?;
                put_list(&mut self.buf, &main.args)?;
            }
            Request::Close => self.buf.push(op::CLOSE),
            Request::KeepAlive => self.buf.push(op::KEEPALIVE),
        }
        self.flush_frame().await
    }

    pub async fn write_output(&mut self, stream: &str, data: &str) -> Result<(), ProtocolError> {
        self.buf.clear();
        self.buf.push(op::OUTPUT);
        put_str(&mut self.buf, stream)?;
        put_str(&mut self.buf, data)?;
        self.flush_frame().await
    }

    pub async fn write_status(&mut self, status: &Status) -> Result<(), ProtocolError> {
        self.buf.clear();
        self.buf.push(op::STATUS);
        self.buf.push(status.kind.wire_byte());
        put_str(&mut self.buf, &status.reason)?;
        self.flush_frame().await
    }

    pub async fn write_keepalive(&mut self) -> Result<(), ProtocolError> {
        self.buf.clear();
        self.buf.push(op::KEEPALIVE);
        self.flush_frame().await
    }

    /// Shut down the write direction, signalling end-of-stream to the peer.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn flush_frame(&mut self) -> Result<(), ProtocolError> {
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// Reads frames from the underlying stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read one controller-to-worker frame. Returns `None` on a clean
    /// end-of-stream at a frame boundary (the controller went away).
    pub async fn read_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        let op = match self.inner.read_u8().await {
            Ok(op) => op,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match op {
            op::DO_COMPILE => {
                let test_name = self.get_str().await?;
                let properties = self.get_map().await?;
                let args = self.get_list().await?;
                Ok(Some(Request::Compile(CompileAction {
                    test_name,
                    properties,
                    args,
                })))
            }
            op::DO_MAIN => {
                let test_name = self.get_str().await?;
                let properties = self.get_map().await?;
                let add_exports = self.get_set().await?;
                let add_opens = self.get_set().await?;
                let add_modules = self.get_set().await?;
                let class_path = self.get_str().await?;
                let module_path = self.get_str().await?;
                let entry_point = self.get_str().await?;
                let args = self.get_list().await?;
                Ok(Some(Request::Main(MainAction {
                    test_name,
                    properties,
                    add_exports,
                    add_opens,
                    add_modules,
                    class_path,
                    module_path,
                    entry_point,
                    args,
                })))
            }
            op::CLOSE => Ok(Some(Request::Close)),
            op::KEEPALIVE => Ok(Some(Request::KeepAlive)),
            other => Err(ProtocolError::UnknownOp(other)),
        }
    }

    /// Read one worker-to-controller frame. End-of-stream here is an error:
    /// the reply loop is only entered while a request is outstanding, so the
    /// stream must not end before a terminal STATUS frame.
    pub async fn read_reply(&mut self) -> Result<Reply, ProtocolError> {
        let op = self.inner.read_u8().await?;
        match op {
            op::OUTPUT => {
                let stream = self.get_str().await?;
                let data = self.get_str().await?;
                Ok(Reply::Output { stream, data })
            }
            op::STATUS => {
                let type_byte = self.inner.read_u8().await?;
                let kind = StatusKind::from_wire(type_byte)
                    .ok_or(ProtocolError::UnknownStatus(type_byte))?;
                let reason = self.get_str().await?;
                Ok(Reply::Status(Status::new(kind, reason)))
            }
            op::KEEPALIVE => Ok(Reply::KeepAlive),
            other => Err(ProtocolError::UnknownOp(other)),
        }
    }

    async fn get_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.inner.read_u16().await? as usize;
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes).await?;
        Ok(String::from_utf8(bytes)?)
    }

    async fn get_count(&mut self) -> Result<usize, ProtocolError> {
        Ok(self.inner.read_u16().await? as usize)
    }

    async fn get_list(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count = self.get_count().await?;
        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            items.push(self.get_str().await?);
        }
        Ok(items)
    }

    async fn get_set(&mut self) -> Result<BTreeSet<String>, ProtocolError> {
        let count = self.get_count().await?;
        let mut items = BTreeSet::new();
        for _ in 0..count {
            items.insert(self.get_str().await?);
        }
        Ok(items)
    }

    async fn get_map(&mut self) -> Result<BTreeMap<String, String>, ProtocolError> {
        let count = self.get_count().await?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.get_str().await?;
            let value = self.get_str().await?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode_request(request: &Request) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_request(request).await.unwrap();
        writer.inner
    }

    #[tokio::test]
    async fn test_compile_request_frame() {
        let mut action = CompileAction::new("lang/ParseTest");
        action
            .properties
            .insert("verbose".to_string(), "1".to_string());
        action.args = vec!["--release".to_string(), "parse.src".to_string()];
        let request = Request::Compile(action);

        let bytes = encode_request(&request).await;
        assert_eq!(bytes[0], op::DO_COMPILE);

        let mut reader = FrameReader::new(bytes.as_slice());
        assert_eq!(reader.read_request().await.unwrap(), Some(request));
        assert_eq!(reader.read_request().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_main_request_frame() {
        let mut action = MainAction::new("api/Smoke", "smoke_main");
        action
            .properties
            .insert("timeout.factor".to_string(), "2".to_string());
        action.add_exports.insert("core/internals".to_string());
        action.add_modules.insert("extras".to_string());
        action.class_path = "build/classes:lib/dep.jar".to_string();
        action.module_path = "build/modules".to_string();
        action.args = vec!["--smoke".to_string()];
        let request = Request::Main(action);

        let bytes = encode_request(&request).await;
        assert_eq!(bytes[0], op::DO_MAIN);

        let mut reader = FrameReader::new(bytes.as_slice());
        assert_eq!(reader.read_request().await.unwrap(), Some(request));
    }

    #[tokio::test]
    async fn test_bare_ops_are_single_bytes() {
        assert_eq!(encode_request(&Request::Close).await, vec![op::CLOSE]);
        assert_eq!(
            encode_request(&Request::KeepAlive).await,
            vec![op::KEEPALIVE]
        );
    }

    #[tokio::test]
    async fn test_reply_frames() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_output(STDOUT_STREAM, "hello\n").await.unwrap();
        writer.write_keepalive().await.unwrap();
        writer
            .write_status(&Status::passed("all ok"))
            .await
            .unwrap();

        let mut reader = FrameReader::new(writer.inner.as_slice());
        assert_eq!(
            reader.read_reply().await.unwrap(),
            Reply::Output {
                stream: STDOUT_STREAM.to_string(),
                data: "hello\n".to_string()
            }
        );
        assert_eq!(reader.read_reply().await.unwrap(), Reply::KeepAlive);
        assert_eq!(
            reader.read_reply().await.unwrap(),
            Reply::Status(Status::passed("all ok"))
        );
    }

    #[tokio::test]
    async fn test_unknown_op_is_fatal_both_directions() {
        let bytes = [0xee_u8];
        let mut reader = FrameReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_reply().await,
            Err(ProtocolError::UnknownOp(0xee))
        ));
        let mut reader = FrameReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_request().await,
            Err(ProtocolError::UnknownOp(0xee))
        ));
    }

    #[tokio::test]
    async fn test_unknown_status_type_byte() {
        let bytes = [op::STATUS, 9, 0, 0];
        let mut reader = FrameReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_reply().await,
            Err(ProtocolError::UnknownStatus(9))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let full = encode_request(&Request::Compile(CompileAction::new("t"))).await;
        let mut reader = FrameReader::new(full[..full.len() - 1].as_ref());
        match reader.read_request().await {
            Err(ProtocolError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_field_rejected_on_write() {
        let mut writer = FrameWriter::new(Vec::new());
        let huge = "x".repeat(MAX_FIELD + 1);
        assert!(matches!(
            writer.write_output(STDOUT_STREAM, &huge).await,
            Err(ProtocolError::FieldTooLarge(_))
        ));
    }
}
