//! Network Module
//!
//! Peer-to-peer gossip transport. `TcpTransport` talks framed TCP between
//! daemons; `LoopbackTransport` connects nodes living in one process.

pub mod protocol;
mod server;
mod client;
mod loopback;

pub use protocol::{ErrorCode, FrameHeader, Message};
pub use server::NetworkServer;
pub use client::{NetworkClient, TcpTransport};
pub use loopback::{LoopbackNetwork, LoopbackTransport};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Answers requests arriving from peers
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message; `None` means no reply is sent
    async fn handle(&self, peer_addr: String, message: Message) -> Option<Message>;
}

/// Moves gossip messages between nodes
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send a request and wait for the reply
    async fn request(&self, address: &str, message: Message) -> Result<Message>;

    /// Start accepting messages for `handler` until `shutdown` turns true.
    /// Returns once the endpoint is reachable.
    async fn serve(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!("Frame too large: {} bytes", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framed_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &Message::Ack).await.unwrap();
        assert!(matches!(read_message(&mut b).await.unwrap(), Message::Ack));
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let body = Message::Ack.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
