//! Peer wire framing
//!
//! Frame format:
//! ```text
//! +---------------+------------------+
//! | length        | JSON body        |
//! | (4 bytes, BE) | (variable)       |
//! +---------------+------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::rpc::{OpResult, RemoteOp};
use crate::error::{NodeError, OpError, Result};
use crate::registry::RegistryEvent;
use crate::NodeId;

/// Length prefix size
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum frame body size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Everything that travels between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerFrame {
    /// First frame on a dialed connection, naming the dialing node
    Hello { node: NodeId },

    /// Remote invocation
    Request { id: Uuid, op: RemoteOp },

    /// Answer to a request, matched by correlation id
    Response {
        id: Uuid,
        result: std::result::Result<OpResult, OpError>,
    },

    /// Registry mirror maintenance pushed by the coordinator
    Event { event: RegistryEvent },
}

/// Encode one frame: length prefix plus JSON body
pub fn encode(frame: &PeerFrame) -> Result<Bytes> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(NodeError::protocol(format!(
            "frame body too large: {} bytes",
            body.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Streaming decoder: feed raw socket bytes, pull complete frames
#[derive(Debug, Default)]
pub struct WireCodec {
    buffer: BytesMut,
}

impl WireCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Feed data into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame.
    /// Returns `Ok(None)` when more data is needed.
    pub fn decode_next(&mut self) -> Result<Option<PeerFrame>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let body_len =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(NodeError::protocol(format!(
                "frame body too large: {} bytes (max {})",
                body_len, MAX_FRAME_SIZE
            )));
        }

        if self.buffer.len() < FRAME_HEADER_SIZE + body_len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_SIZE);
        let body = self.buffer.split_to(body_len);
        let frame = serde_json::from_slice(&body)?;
        Ok(Some(frame))
    }

    /// Bytes currently buffered
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
