//! IPC protocol messages for scratchpad worker processes.
//!
//! Uses length-prefixed JSON messages over the worker's stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON-encoded message.
//!
//! Blocking helpers ([`write_message`], [`read_message`]) are used by the
//! worker; async helpers ([`write_frame`], [`read_frame`]) by the supervisor.

use std::io::{Read, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::record::ResultRecord;

/// Frames larger than this are rejected as corrupt.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Command line flag carrying the worker's working directory.
pub const WORKING_DIR_ARG: &str = "--working-dir";

/// Command line flag carrying the handshake channel id.
pub const CHANNEL_ARG: &str = "--channel";

/// Command sent from supervisor to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Execute a compiled payload.
    RunRequest {
        /// Compiled payload produced by the compiler.
        #[serde(with = "payload_base64")]
        payload: Vec<u8>,
        /// Restored package directories the script may load from.
        package_paths: Vec<PathBuf>,
    },

    /// Ask the running script to stop.
    CancelRequest,

    /// Exit the worker process gracefully.
    Shutdown,
}

/// Message sent from worker to supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker is ready to accept `RunRequest`s.
    Ready {
        /// Channel id the worker was launched with.
        channel: String,
        /// Process ID of the worker.
        pid: u32,
    },

    /// One result record of the current run.
    Record { record: ResultRecord },

    /// The current run finished.
    RunComplete,

    /// The current run stopped after a `CancelRequest`.
    RunCanceled,

    /// The worker hit an unrecoverable error and is about to exit.
    FatalError { message: String },
}

mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "IPC message too large: {} bytes",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

fn check_len(len_bytes: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("IPC message too large: {} bytes", len)));
    }
    Ok(len)
}

/// Write a message to a blocking writer.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let frame = encode(message)?;
    writer
        .write_all(&frame)
        .map_err(|e| Error::Transport(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Transport(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read a message from a blocking reader.
///
/// Returns `Ok(None)` when the stream ends cleanly at a frame boundary.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader
            .read(&mut len_bytes[filled..])
            .map_err(|e| Error::Transport(format!("Failed to read IPC message length: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Transport("IPC stream ended inside a frame header".to_string()));
        }
        filled += n;
    }

    let len = check_len(len_bytes)?;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::Transport(format!("Failed to read IPC message body: {}", e)))?;

    decode(&body).map(Some)
}

/// Write a message to an async writer.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let frame = encode(message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::Transport(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read a message from an async reader.
///
/// Returns `Ok(None)` when the stream ends cleanly at a frame boundary.
/// Not cancel-safe: dropping the future mid-frame loses the frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader
            .read(&mut len_bytes[filled..])
            .await
            .map_err(|e| Error::Transport(format!("Failed to read IPC message length: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Transport("IPC stream ended inside a frame header".to_string()));
        }
        filled += n;
    }

    let len = check_len(len_bytes)?;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Transport(format!("Failed to read IPC message body: {}", e)))?;

    decode(&body).map(Some)
}
