use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::constants::HANDSHAKE_LEN;

/// Read half of a peer socket, buffered and length-prefix framed.
pub struct FrameReader<R> {
    inner: R,
    read_buf: BytesMut,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        Self {
            inner,
            read_buf: BytesMut::with_capacity(32 * 1024),
            read_timeout,
        }
    }

    async fn fill(&mut self, wanted: usize) -> Result<(), PeerError> {
        while self.read_buf.len() < wanted {
            let n = timeout(self.read_timeout, self.inner.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;

            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }

    pub async fn read_handshake(&mut self) -> Result<Handshake, PeerError> {
        self.fill(HANDSHAKE_LEN).await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Reads the next frame. Keepalives come back as [`Message::KeepAlive`];
    /// frames with an unknown ID come back as `None`.
    pub async fn read_message(&mut self) -> Result<Option<Message>, PeerError> {
        self.fill(4).await?;
        let raw = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]);
        let length = Message::frame_len(raw)?;

        self.fill(4 + length).await?;
        self.read_buf.advance(4);
        let body = self.read_buf.split_to(length).freeze();
        Message::decode_body(body)
    }
}

/// Write half of a peer socket. Only the link's writer task owns one.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.inner.write_all(&handshake.encode()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<(), PeerError> {
        self.inner.write_all(&message.encode()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
