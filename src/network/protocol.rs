//! Gossip Protocol
//!
//! Defines the wire protocol for communication between nodes.

use serde::{Deserialize, Serialize};

use crate::types::Node;

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Heartbeat ==========
    /// Liveness probe carrying the sender's current view of itself
    Heartbeat {
        cluster_id: String,
        node: Node,
    },

    /// Probe answer carrying the responder's current view of itself
    HeartbeatAck {
        node: Node,
    },

    // ========== Lifecycle ==========
    /// Sender is leaving the cluster gracefully
    Leave {
        cluster_id: String,
        node: Node,
    },

    /// Ask the receiver to shut down (cluster-wide shutdown)
    ShutdownRequest {
        cluster_id: String,
        from: String,
    },

    /// Generic acknowledgement
    Ack,

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Sender belongs to another cluster
    ClusterMismatch,
    /// Receiver is not accepting requests
    NotRunning,
    /// Message not valid as a request
    Unexpected,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::Leave { .. } => "Leave",
            Message::ShutdownRequest { .. } => "ShutdownRequest",
            Message::Ack => "Ack",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted message body
    pub const MAX_LENGTH: u32 = 4 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    #[test]
    fn test_heartbeat_serialization() {
        let msg = Message::Heartbeat {
            cluster_id: "c1".to_string(),
            node: Node {
                id: "n1".to_string(),
                ip: "127.0.0.1:9010".to_string(),
                status: Status::Ok,
                gen_number: 42,
                timestamp: chrono::Utc::now(),
            },
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Heartbeat { cluster_id, node } => {
                assert_eq!(cluster_id, "c1");
                assert_eq!(node.id, "n1");
                assert_eq!(node.gen_number, 42);
                assert_eq!(node.status, Status::Ok);
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(restored.length, data.len() as u32);
        assert_eq!(restored.checksum, crc32fast::hash(data));
    }
}
