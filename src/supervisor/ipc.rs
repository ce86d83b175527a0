//! The supervisor/worker channel: one Unix domain socket carrying a single
//! newline-terminated JSON handshake from the worker.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::os::fd::{FromRawFd, RawFd};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

pub const HANDSHAKE_OK: i32 = 0;
pub const HANDSHAKE_FAILED: i32 = 1;
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub code: i32,
    pub message: String,
}

impl HandshakeMessage {
    pub fn started() -> Self {
        Self {
            code: HANDSHAKE_OK,
            message: "started".to_owned(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            code: HANDSHAKE_FAILED,
            message: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == HANDSHAKE_OK
    }
}

pub struct IpcChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl IpcChannel {
    /// Two connected ends, for in-process workers and tests.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair().context("failed to create channel pair")?;
        Ok((Self::from_stream(left), Self::from_stream(right)))
    }

    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .context("failed to make channel non-blocking")?;
        let stream = UnixStream::from_std(stream).context("failed to register channel")?;
        Ok(Self::from_stream(stream))
    }

    /// Adopts an inherited socket descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open Unix stream socket owned by nothing else in this
    /// process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        Self::from_std(std::os::unix::net::UnixStream::from_raw_fd(fd))
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, message: &HandshakeMessage) -> Result<()> {
        let mut line = serde_json::to_vec(message).context("failed to encode handshake")?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .context("failed to send handshake")?;
        self.writer.flush().await.context("failed to flush handshake")?;
        Ok(())
    }

    /// Waits for the next message. `None` means the peer closed the channel
    /// without sending one.
    pub async fn recv(&mut self) -> Result<Option<HandshakeMessage>> {
        let mut line = String::new();
        let read = (&mut self.reader)
            .take(MAX_MESSAGE_BYTES as u64)
            .read_line(&mut line)
            .await
            .context("failed to read handshake")?;
        if read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && read >= MAX_MESSAGE_BYTES {
            bail!("handshake exceeds {MAX_MESSAGE_BYTES} bytes");
        }

        let message = serde_json::from_str(line.trim_end())
            .with_context(|| format!("malformed handshake: {}", line.trim_end()))?;
        Ok(Some(message))
    }

    /// Non-blocking check that the peer still holds its end open. Stray
    /// bytes are discarded.
    pub fn is_peer_alive(&self) -> bool {
        let mut scratch = [0u8; 256];
        loop {
            match self.reader.get_ref().try_read(&mut scratch) {
                Ok(0) => return false,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}
