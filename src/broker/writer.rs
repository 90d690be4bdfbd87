//! Direct write buffer shared between a connection and its publishers.
//!
//! Fan-out encodes straight into the per-connection buffer and the
//! connection task flushes it to the socket.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::{Packet, Publish};

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Closed,
    /// Pending bytes exceed the slow-consumer limit
    Full,
    EncodingError,
}

pub struct SharedWriter {
    buffer: Mutex<BytesMut>,
    notify: Notify,
    encoder: Encoder,
    alive: AtomicBool,
    max_packet_size: usize,
    max_pending: usize,
}

impl SharedWriter {
    pub fn new(max_packet_size: usize, max_pending: usize) -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            encoder: Encoder::new(),
            alive: AtomicBool::new(true),
            max_packet_size,
            max_pending,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().split()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Queue a QoS 0 PUBLISH.
    pub fn send_message(&self, topic: Bytes, payload: Bytes) -> Result<(), SendError> {
        self.send_packet(&Packet::Publish(Publish {
            topic,
            payload,
            ..Default::default()
        }))
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.max_pending {
                return Err(SendError::Full);
            }

            let start_len = buffer.len();
            if self.encoder.encode(packet, &mut buffer).is_err() {
                buffer.truncate(start_len);
                return Err(SendError::EncodingError);
            }

            if buffer.len() - start_len > self.max_packet_size {
                buffer.truncate(start_len);
                return Ok(());
            }
            start_len == 0
        };

        // Coalesce wakeups during bursts
        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWriter")
            .field("buffer_len", &self.buffer_len())
            .field("alive", &self.is_alive())
            .finish()
    }
}
