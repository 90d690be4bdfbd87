//! MQTT Connection Handler
//!
//! Reads packets from one client, hands PUBLISH/SUBSCRIBE/UNSUBSCRIBE to
//! the service and flushes the connection's shared writer to the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::config::ServerConfig;
use crate::id;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, Publish, QoS, SubAck, Subscribe,
    Unsubscribe, SUBACK_FAILURE,
};
use crate::service::{Service, ERROR_CHANNEL};
use crate::session::{Session, WillMessage};

use super::SharedWriter;

#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    Protocol(&'static str),
    Timeout,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Encode(e) => write!(f, "Encode error: {}", e),
            ConnectionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

/// How the packet loop ended.
enum Exit {
    /// Client sent DISCONNECT; the will is dropped
    Clean,
    /// Socket closed, keep-alive expired or the writer gave up
    Abnormal,
}

/// Releases an accepted session when the connection task ends, including
/// when it panics or is cancelled mid-run.
struct SessionGuard {
    service: Arc<Service>,
    session: Arc<Session>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.writer().close();
        self.service.close(&self.session);
        self.service.metrics().client_disconnected();

        // Only left set when the task never reached its own will handling.
        if self.session.has_will() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let service = self.service.clone();
                let session = self.session.clone();
                handle.spawn(async move { publish_will(&service, &session).await });
            }
        }
    }
}

async fn publish_will(service: &Service, session: &Arc<Session>) {
    if let Err(e) = service.on_last_will(session).await {
        debug!("Will of {} rejected: {}", session.client_id(), e);
    }
}

/// Connection handler, generic over the stream type
pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    service: Arc<Service>,
    config: ServerConfig,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, service: Arc<Service>, config: ServerConfig) -> Self {
        Self {
            stream,
            addr,
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
            service,
            config,
        }
    }

    /// Run the connection until the client leaves.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let connect = match timeout(self.config.connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("Connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        };

        let Some((session, keep_alive)) = self.accept(*connect).await? else {
            return Ok(());
        };

        self.service.metrics().client_connected();
        let guard = SessionGuard {
            service: self.service.clone(),
            session: session.clone(),
        };
        let result = self.run_connected(&session, keep_alive).await;

        let abnormal = !matches!(result, Ok(Exit::Clean));
        if abnormal {
            publish_will(&self.service, &session).await;
        }
        drop(guard);
        debug!("Connection {} from {} closed", session.client_id(), self.addr);

        result.map(|_| ())
    }

    /// Waits for the first packet, which must be CONNECT.
    async fn read_connect(&mut self) -> Result<Box<Connect>, ConnectionError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return match packet {
                    Packet::Connect(connect) => Ok(connect),
                    _ => Err(ConnectionError::Protocol("first packet was not CONNECT")),
                };
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ConnectionError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    /// Answers CONNECT; returns the session and the keep-alive deadline
    /// interval, or `None` when the client was refused.
    async fn accept(&mut self, connect: Connect) -> Result<Option<(Arc<Session>, Duration)>, ConnectionError> {
        if connect.client_id.is_empty() && !connect.clean_session {
            self.write_packet(&Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::IdentifierRejected,
            }))
            .await?;
            return Ok(None);
        }

        let client_id = if connect.client_id.is_empty() {
            format!("auto-{:X}", id::next())
        } else {
            connect.client_id
        };
        let writer = Arc::new(SharedWriter::new(
            self.config.max_packet_size,
            self.config.outbound_buffer_size,
        ));
        let session = Arc::new(Session::new(
            self.service.peer_id(),
            client_id,
            connect.username.unwrap_or_default(),
            writer,
        ));
        session.set_will(connect.will.map(|will| WillMessage {
            topic: will.topic,
            payload: will.payload,
            retain: will.retain,
        }));

        self.write_packet(&Packet::ConnAck(ConnAck::default())).await?;
        info!(
            "Client {} connected from {} as {}",
            session.client_id(),
            self.addr,
            session.name()
        );

        let keep_alive_secs = match connect.keep_alive {
            0 => self.config.default_keep_alive,
            secs => secs,
        };
        // 1.5x keep alive, 0 disables
        let keep_alive = match keep_alive_secs {
            0 => Duration::MAX,
            secs => Duration::from_millis(secs as u64 * 1500),
        };
        Ok(Some((session, keep_alive)))
    }

    async fn run_connected(&mut self, session: &Arc<Session>, keep_alive: Duration) -> Result<Exit, ConnectionError> {
        let writer = session.writer().clone();
        let deadline = |now: tokio::time::Instant| now.checked_add(keep_alive).unwrap_or(now + Duration::from_secs(86400 * 365));
        let mut keep_alive_deadline = deadline(tokio::time::Instant::now());

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed from {}", self.addr);
                            return Ok(Exit::Abnormal);
                        }
                        Ok(_) => {
                            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                                self.read_buf.advance(consumed);
                                keep_alive_deadline = deadline(tokio::time::Instant::now());
                                if let Some(exit) = self.handle_packet(session, packet).await? {
                                    return Ok(exit);
                                }
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                _ = writer.notified() => {
                    let data = writer.take_buffer();
                    if !data.is_empty() {
                        self.stream.write_all(&data).await?;
                    }
                    if !writer.is_alive() {
                        debug!("Writer closed, disconnecting {}", session.client_id());
                        return Ok(Exit::Abnormal);
                    }
                }

                _ = tokio::time::sleep_until(keep_alive_deadline) => {
                    info!("Keep alive timeout for {} - disconnecting", session.client_id());
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }

    async fn handle_packet(&mut self, session: &Arc<Session>, packet: Packet) -> Result<Option<Exit>, ConnectionError> {
        match packet {
            Packet::Connect(_) => return Err(ConnectionError::Protocol("duplicate CONNECT")),
            Packet::Publish(publish) => self.handle_publish(session, publish).await?,
            Packet::PubRel(id) => self.write_packet(&Packet::PubComp(id)).await?,
            // Deliveries are QoS 0, acknowledgements need no tracking
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {}
            Packet::Subscribe(subscribe) => self.handle_subscribe(session, subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(session, unsubscribe).await?,
            Packet::PingReq => self.write_packet(&Packet::PingResp).await?,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", session.client_id());
                session.take_will();
                return Ok(Some(Exit::Clean));
            }
            other => {
                warn!(
                    "Unexpected packet type {} from {}",
                    other.packet_type(),
                    session.client_id()
                );
            }
        }
        Ok(None)
    }

    async fn handle_publish(&mut self, session: &Arc<Session>, publish: Publish) -> Result<(), ConnectionError> {
        if let Err(e) = self
            .service
            .on_publish(session, &publish.topic, publish.payload, publish.retain)
            .await
        {
            debug!("Publish of {} rejected: {}", session.client_id(), e);
            let _ = session.reply(ERROR_CHANNEL, e.to_reply(0));
        }

        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => self.write_packet(&Packet::PubAck(id)).await,
            (QoS::ExactlyOnce, Some(id)) => self.write_packet(&Packet::PubRec(id)).await,
            _ => Ok(()),
        }
    }

    async fn handle_subscribe(&mut self, session: &Arc<Session>, subscribe: Subscribe) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        for (filter, _qos) in &subscribe.filters {
            match self.service.on_subscribe(session, filter).await {
                Ok(()) => return_codes.push(QoS::AtMostOnce as u8),
                Err(e) => {
                    debug!("Subscribe of {} rejected: {}", session.client_id(), e);
                    let _ = session.reply(ERROR_CHANNEL, e.to_reply(0));
                    return_codes.push(SUBACK_FAILURE);
                }
            }
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await
    }

    async fn handle_unsubscribe(
        &mut self,
        session: &Arc<Session>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            if let Err(e) = self.service.on_unsubscribe(session, filter).await {
                debug!("Unsubscribe of {} rejected: {}", session.client_id(), e);
                let _ = session.reply(ERROR_CHANNEL, e.to_reply(0));
            }
        }
        self.write_packet(&Packet::UnsubAck(unsubscribe.packet_id)).await
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}
