//! Framed message I/O over a byte stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{self, Message};

/// Byte stream a connection can run over.
///
/// Blanket-implemented; the connection erases the provider's concrete stream
/// type behind `Box<dyn AsyncStream>` so handshakes stay object-safe.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncStream for T {}

/// Framed [`Message`] transport over an owned byte stream.
///
/// Reads are buffered: partial frames accumulate across calls, so `recv` is
/// safe to use inside `select!`.
pub struct MessageIo {
    stream: Box<dyn AsyncStream>,
    rx_buf: Vec<u8>,
}

impl MessageIo {
    /// Wrap a stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        Self {
            stream: Box::new(stream),
            rx_buf: Vec::with_capacity(4096),
        }
    }

    /// Receive the next message.
    ///
    /// Returns `None` on peer disconnect, read error, or a malformed frame;
    /// in all three cases the connection is unusable and the caller tears it
    /// down.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match wire::try_decode_frame(&self.rx_buf) {
                Ok(Some((msg, consumed))) => {
                    self.rx_buf.drain(..consumed);
                    return Some(msg);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "wire format error, tearing down connection");
                    return None;
                }
            }

            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk).await {
                Ok(0) => return None,
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "read error");
                    return None;
                }
            }
        }
    }

    /// Send a batch of messages as one write.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error, or `InvalidData` if a message
    /// fails to encode.
    pub async fn send_batch(&mut self, msgs: &[Message]) -> io::Result<()> {
        let mut out = Vec::new();
        for msg in msgs {
            let frame = wire::encode_frame(msg)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            out.extend_from_slice(&frame);
        }
        self.stream.write_all(&out).await?;
        self.stream.flush().await
    }
}
