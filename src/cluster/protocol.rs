//! Peer link protocol
//!
//! Length-prefixed bincode frames. Replicated state and message batches
//! are carried as opaque bytes in their own encodings.

use bincode::{Decode, Encode};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ClusterError;

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ClusterMessage {
    /// Sent by the dialing side.
    Hello {
        peer_id: u64,
        /// Where the sender accepts peer links
        peer_addr: String,
        version: u8,
    },

    HelloAck { peer_id: u64, version: u8 },

    /// Encoded replicated state (full or delta)
    Gossip { state: Vec<u8> },

    /// Encoded message frame for local delivery on the receiver
    Messages { frame: Vec<u8> },

    Ping,

    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::Gossip { .. } => "Gossip",
            ClusterMessage::Messages { .. } => "Messages",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Reads the next message, buffering partial frames in `buf`.
/// Returns `None` on a clean end of stream. Cancel safe.
pub async fn read_message<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<ClusterMessage>, ClusterError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(len) = read_frame_length(buf) {
            let len = len as usize;
            if len > MAX_FRAME_LEN {
                return Err(ClusterError::FrameTooLarge(len));
            }
            if buf.len() >= 4 + len {
                buf.advance(4);
                let frame = buf.split_to(len);
                return Ok(Some(ClusterMessage::decode(&frame)?));
            }
        }
        if reader.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

pub async fn write_message<W>(writer: &mut W, msg: &ClusterMessage) -> Result<(), ClusterError>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_message(msg)?;
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_survives_framing() {
        let msg = ClusterMessage::Hello {
            peer_id: 42,
            peer_addr: "10.0.0.1:7947".to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        let frame = frame_message(&msg).unwrap();
        let len = read_frame_length(&frame).unwrap();
        assert_eq!(len as usize, frame.len() - 4);
        assert_eq!(ClusterMessage::decode(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn test_short_length_prefix() {
        assert_eq!(read_frame_length(&[0, 0, 1]), None);
    }

    #[tokio::test]
    async fn test_read_write_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = vec![
            ClusterMessage::Ping,
            ClusterMessage::Messages { frame: vec![7; 300] },
            ClusterMessage::Goodbye,
        ];
        let expected = sent.clone();
        let writer = tokio::spawn(async move {
            for msg in &sent {
                write_message(&mut a, msg).await.unwrap();
            }
        });

        let mut buf = BytesMut::new();
        for msg in expected {
            assert_eq!(read_message(&mut b, &mut buf).await.unwrap(), Some(msg));
        }
        writer.await.unwrap();
        assert_eq!(read_message(&mut b, &mut buf).await.unwrap(), None);
    }

    #[test]
    fn test_type_name() {
        assert_eq!(ClusterMessage::Ping.type_name(), "Ping");
        assert_eq!(
            ClusterMessage::Gossip { state: vec![] }.type_name(),
            "Gossip"
        );
    }
}
