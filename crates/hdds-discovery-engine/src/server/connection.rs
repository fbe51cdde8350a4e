// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link framing for the discovery service.
//!
//! A link is split into a [`FrameReader`] owned by the connection task and a
//! [`FrameWriter`] owned by a writer task draining the link's queue, so slow
//! writes never stall message processing.

use super::protocol::WireMessage;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Reading half of a link.
pub struct FrameReader<R> {
    inner: R,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_message_size: usize) -> Self {
        Self {
            inner,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Read one message.
    ///
    /// Returns `Ok(None)` if the link is closed gracefully.
    pub async fn read_message(&mut self) -> Result<Option<WireMessage>, ConnectionError> {
        // Length prefix (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(ConnectionError::Protocol("Empty message".into()));
        }
        if len > self.max_message_size {
            return Err(ConnectionError::TooLarge {
                len,
                max: self.max_message_size,
            });
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);
        self.inner.read_exact(&mut self.read_buffer).await?;

        let msg = serde_json::from_slice(&self.read_buffer)
            .map_err(|e| ConnectionError::Protocol(format!("Invalid JSON: {}", e)))?;
        Ok(Some(msg))
    }
}

/// Writing half of a link.
pub struct FrameWriter<W> {
    inner: W,
    max_message_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_message_size: usize) -> Self {
        Self {
            inner,
            max_message_size,
        }
    }

    /// Send one message.
    pub async fn send_message(&mut self, msg: &WireMessage) -> Result<(), ConnectionError> {
        let json = serde_json::to_vec(msg)
            .map_err(|e| ConnectionError::Protocol(format!("Serialize error: {}", e)))?;
        if json.len() > self.max_message_size {
            return Err(ConnectionError::TooLarge {
                len: json.len(),
                max: self.max_message_size,
            });
        }

        let len = json.len() as u32;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&json).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a TCP stream into framed halves.
pub fn split(
    stream: TcpStream,
    max_message_size: usize,
) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
    let (read, write) = stream.into_split();
    (
        FrameReader::new(read, max_message_size),
        FrameWriter::new(write, max_message_size),
    )
}

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Protocol error: message too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },
}
