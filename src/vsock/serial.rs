//! The line-framed serial fallback used when vsock registration doesn't
//! arrive within the startup grace period, or the control-port listener
//! sees `ECONNRESET`/`EPIPE` with no guest reconnect (spec §4.5).
//!
//! Capabilities are a strict subset of the vsock protocol: no streaming,
//! entire payloads base64-encoded in a single JSON line, and a hard size cap
//! on file transfers. This trades throughput for correctness, as the spec
//! explicitly allows.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::Limits;

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("I/O error on the serial console: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed serial record")]
    Malformed(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("upload of {size} bytes exceeds the {cap} byte serial fallback cap")]
    UploadTooLarge { size: u64, cap: u64 },
}

/// One line-delimited record on the serial console. A strict subset of the
/// vsock protocol's message types (spec §4.5): `ping`, `exec`, `session_*`,
/// and non-streaming `upload`/`download`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SerialRecord {
    Ping {
        id: String,
    },
    Pong {
        id: String,
    },
    Exec {
        id: String,
        cmd_id: String,
        argv: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
        #[serde(default)]
        cwd: Option<String>,
        timeout_ms: u64,
    },
    ExecResult {
        id: String,
        cmd_id: String,
        exit_code: i32,
        stdout_tail: String,
        stderr_tail: String,
    },
    SessionStart {
        id: String,
        session_id: String,
        argv: Vec<String>,
    },
    SessionInput {
        id: String,
        session_id: String,
        data_b64: String,
    },
    SessionSignal {
        id: String,
        session_id: String,
        signum: i32,
    },
    SessionResize {
        id: String,
        session_id: String,
        cols: u16,
        rows: u16,
    },
    SessionKill {
        id: String,
        session_id: String,
    },
    SessionOutput {
        id: String,
        session_id: String,
        data_b64: String,
    },
    SessionExit {
        id: String,
        session_id: String,
        exit_code: i32,
    },
    /// Entire file content, base64-encoded, in one record.
    Upload {
        id: String,
        path: String,
        data_b64: String,
        checksum_md5: String,
    },
    Download {
        id: String,
        path: String,
    },
    DownloadReply {
        id: String,
        data_b64: String,
        checksum_md5: String,
    },
    Success {
        id: String,
    },
    Error {
        id: String,
        code: String,
    },
}

/// A bridge to the VMM's serial console, speaking [`SerialRecord`] lines.
pub struct SerialBridge<T> {
    reader: BufReader<tokio::io::ReadHalf<T>>,
    writer: tokio::io::WriteHalf<T>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> SerialBridge<T> {
    pub fn new(transport: T) -> Self {
        let (read_half, writer) = tokio::io::split(transport);
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send(&mut self, record: &SerialRecord) -> Result<(), SerialError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<SerialRecord, SerialError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(SerialError::Closed);
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Validates an upload's declared size against the serial fallback cap
    /// (spec §4.5, §8): rejected uploads never reach the wire.
    pub fn check_upload_size(size: u64, limits: &Limits) -> Result<(), SerialError> {
        if size > limits.serial_upload_cap_bytes {
            return Err(SerialError::UploadTooLarge {
                size,
                cap: limits.serial_upload_cap_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_record_over_a_duplex_stream() {
        let (client, server) = duplex(4096);
        let mut client_bridge = SerialBridge::new(client);
        let mut server_bridge = SerialBridge::new(server);

        client_bridge
            .send(&SerialRecord::Ping { id: "1".to_string() })
            .await
            .unwrap();
        let received = server_bridge.recv().await.unwrap();
        assert_matches::assert_matches!(received, SerialRecord::Ping { id } if id == "1");
    }

    #[test]
    fn rejects_uploads_over_the_cap() {
        let limits = Limits::default();
        let err = SerialBridge::<tokio::io::DuplexStream>::check_upload_size(9 * 1024 * 1024, &limits)
            .unwrap_err();
        assert_matches::assert_matches!(err, SerialError::UploadTooLarge { .. });
    }
}
