//! Integration tests for the vibemesh broker
//!
//! These tests run a broker on an ephemeral port and drive it with a
//! minimal MQTT 3.1.1 client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use vibemesh::broker::Broker;
use vibemesh::clock::Clock;
use vibemesh::codec::{Decoder, Encoder};
use vibemesh::config::Config;
use vibemesh::event::{State, Subscription};
use vibemesh::message::Ssid;
use vibemesh::protocol::{Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe};
use vibemesh::security::perm;
use vibemesh::{Channel, License};

struct TestBroker {
    broker: Arc<Broker>,
    addr: SocketAddr,
    license: License,
    master: String,
}

impl TestBroker {
    async fn start() -> Self {
        let license = License::v3([3; 32], 77, 5);
        let mut config = Config::default();
        config.license.license = license.to_string();

        let broker = Arc::new(Broker::new(config).await.expect("broker"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = broker.clone();
        tokio::spawn(async move { running.serve(listener).await });

        let master = license.cipher().encrypt_key(&license.new_master_key(1));
        Self {
            broker,
            addr,
            license,
            master,
        }
    }

    async fn client(&self, id: &str) -> TestClient {
        let mut client = TestClient::connect(self.addr).await;
        let code = client.handshake(id).await;
        assert_eq!(code, ConnectReturnCode::Accepted);
        client
    }

    /// Mints a key through the in-band keygen request.
    async fn keygen(&self, client: &mut TestClient, channel: &str, access: &str, ttl: u32) -> String {
        let request = serde_json::json!({
            "req": 1,
            "key": self.master,
            "channel": channel,
            "type": access,
            "ttl": ttl,
        });
        client.publish("emitter/keygen/", request.to_string().as_bytes()).await;
        let reply = client.recv().await;
        assert_eq!(&reply.topic[..], b"emitter/keygen/");
        let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["status"], 200, "keygen failed: {}", body);
        body["key"].as_str().unwrap().to_string()
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.broker.shutdown();
    }
}

struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
    next_id: u16,
    pending: Vec<Publish>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(stream) = TcpStream::connect(addr).await {
                    return stream;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("broker not reachable");

        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
            next_id: 1,
            pending: Vec::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn read_packet(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some((packet, used)) = self.decoder.decode(&self.buf).unwrap() {
                self.buf.advance(used);
                return Some(packet);
            }
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Err(_) => return None,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => panic!("read failed: {}", e),
            }
        }
    }

    async fn handshake(&mut self, id: &str) -> ConnectReturnCode {
        self.send(&Packet::Connect(Box::new(Connect {
            client_id: id.to_string(),
            username: Some(id.to_string()),
            ..Default::default()
        })))
        .await;
        match self.read_packet(Duration::from_secs(2)).await {
            Some(Packet::ConnAck(ack)) => ack.code,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, topic: &str) {
        let packet_id = self.next_id;
        self.next_id += 1;
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![(Bytes::copy_from_slice(topic.as_bytes()), QoS::AtMostOnce)],
        }))
        .await;

        // History may be flushed ahead of the acknowledgement
        loop {
            match self.read_packet(Duration::from_secs(2)).await {
                Some(Packet::SubAck(SubAck { return_codes, .. })) => {
                    assert_eq!(return_codes, vec![0], "subscription to {} refused", topic);
                    return;
                }
                Some(Packet::Publish(p)) => self.pending.push(p),
                other => panic!("expected SUBACK, got {:?}", other),
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) {
        self.send(&Packet::Publish(Publish {
            topic: Bytes::copy_from_slice(topic.as_bytes()),
            payload: Bytes::copy_from_slice(payload),
            ..Default::default()
        }))
        .await;
    }

    async fn recv(&mut self) -> Publish {
        if !self.pending.is_empty() {
            return self.pending.remove(0);
        }
        match self.read_packet(Duration::from_secs(2)).await {
            Some(Packet::Publish(p)) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    /// Every PUBLISH that arrives within `wait`.
    async fn drain(&mut self, wait: Duration) -> Vec<Publish> {
        let mut out = std::mem::take(&mut self.pending);
        while let Some(packet) = self.read_packet(wait).await {
            if let Packet::Publish(p) = packet {
                out.push(p);
            }
        }
        out
    }
}

#[tokio::test]
async fn test_exact_channel_delivers_once() {
    let broker = TestBroker::start().await;
    let mut sub = broker.client("sub").await;
    let mut publisher = broker.client("pub").await;

    let read = broker.keygen(&mut sub, "a/b/c/", "r", 0).await;
    let write = broker.keygen(&mut publisher, "a/b/c/", "w", 0).await;

    sub.subscribe(&format!("{}/a/b/c/", read)).await;
    publisher.publish(&format!("{}/a/b/c/", write), b"hi").await;

    let received = sub.drain(Duration::from_millis(300)).await;
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0].topic[..], b"a/b/c/");
    assert_eq!(&received[0].payload[..], b"hi");
}

#[tokio::test]
async fn test_single_level_wildcard() {
    let broker = TestBroker::start().await;
    let mut sub = broker.client("sub").await;
    let mut publisher = broker.client("pub").await;

    let read = broker.keygen(&mut sub, "a/+/c/", "r", 0).await;
    let write = broker.keygen(&mut publisher, "a/+/c/", "w", 0).await;

    sub.subscribe(&format!("{}/a/+/c/", read)).await;
    publisher.publish(&format!("{}/a/x/c/", write), b"1").await;
    publisher.publish(&format!("{}/a/y/c/", write), b"2").await;

    let received = sub.drain(Duration::from_millis(300)).await;
    let topics: Vec<_> = received.iter().map(|p| p.topic.clone()).collect();
    assert_eq!(topics, vec![Bytes::from_static(b"a/x/c/"), Bytes::from_static(b"a/y/c/")]);
}

#[tokio::test]
async fn test_stored_message_replayed() {
    let broker = TestBroker::start().await;
    let mut publisher = broker.client("pub").await;
    let write = broker.keygen(&mut publisher, "a/b/c/", "ws", 0).await;
    publisher.publish(&format!("{}/a/b/c/?ttl=30", write), b"old").await;
    publisher.publish(&format!("{}/a/b/c/?ttl=30", write), b"last").await;
    // Publishes are fire-and-forget; give the broker time to store them
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub = broker.client("late").await;
    let read = broker.keygen(&mut sub, "a/b/c/", "rl", 0).await;
    sub.subscribe(&format!("{}/a/b/c/?last=1", read)).await;

    let received = sub.drain(Duration::from_millis(300)).await;
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0].payload[..], b"last");
}

#[tokio::test]
async fn test_shared_subscription_spreads_load() {
    let broker = TestBroker::start().await;
    let mut members = Vec::new();
    for i in 0..3 {
        let mut member = broker.client(&format!("member{}", i)).await;
        let key = broker.keygen(&mut member, "$share/g1/a/", "r", 0).await;
        member.subscribe(&format!("{}/$share/g1/a/", key)).await;
        members.push(member);
    }

    let mut publisher = broker.client("pub").await;
    let write = broker.keygen(&mut publisher, "a/", "w", 0).await;
    for i in 0..90 {
        publisher.publish(&format!("{}/a/", write), i.to_string().as_bytes()).await;
    }

    let mut total = 0;
    for member in &mut members {
        let got = member.drain(Duration::from_millis(500)).await.len();
        assert!((18..=42).contains(&got), "member received {} of 90", got);
        total += got;
    }
    assert_eq!(total, 90);
}

#[test]
fn test_gossip_converges() {
    let p1 = State::new(Clock::System);
    let p2 = State::new(Clock::System);
    let remote = Subscription {
        peer: 2,
        conn: 9,
        user: "u".into(),
        channel: Bytes::from_static(b"a/"),
        ssid: Ssid::new(1, &[42]),
    };
    p1.add(&remote);

    let first = p2.merge(State::decode(&p1.encode(), Clock::System).unwrap());
    assert!(first.is_some());
    assert!(p2.contains(&remote));
    assert_eq!(p1.contains(&remote), p2.contains(&remote));

    let second = p2.merge(State::decode(&p1.encode(), Clock::System).unwrap());
    assert!(second.map_or(true, |delta| delta.is_empty()));
}

#[tokio::test]
async fn test_keygen_scoped_key() {
    let broker = TestBroker::start().await;
    let mut client = broker.client("c").await;
    let text = broker.keygen(&mut client, "x/", "rws", 60).await;

    let key = broker.license.cipher().decrypt_key(text.as_bytes()).unwrap();
    assert_eq!(key.permissions(), perm::READ | perm::WRITE | perm::STORE);
    assert_eq!(key.contract(), broker.license.contract());
    assert!(!key.is_expired_at(vibemesh::clock::now_secs()));
    assert!(key.validate_channel(&Channel::parse(format!("{}/x/", text).as_bytes())));
}

#[tokio::test]
async fn test_request_errors_are_reported() {
    let broker = TestBroker::start().await;
    let mut client = broker.client("c").await;

    client.publish("emitter/nope/", b"{\"req\": 11}").await;
    let reply = client.recv().await;
    assert_eq!(&reply.topic[..], b"emitter/error/");
    let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(body["req"], 11);
    assert_eq!(body["status"], 501);
}

#[tokio::test]
async fn test_unauthorized_publish_is_reported() {
    let broker = TestBroker::start().await;
    let mut client = broker.client("c").await;
    let read = broker.keygen(&mut client, "a/", "r", 0).await;

    client.publish(&format!("{}/a/", read), b"x").await;
    let reply = client.recv().await;
    assert_eq!(&reply.topic[..], b"emitter/error/");
    let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(body["status"], 401);
}

#[tokio::test]
async fn test_last_will_on_abrupt_close() {
    let broker = TestBroker::start().await;
    let mut watcher = broker.client("watcher").await;
    let key = broker.keygen(&mut watcher, "status/", "rw", 0).await;
    watcher.subscribe(&format!("{}/status/", key)).await;

    let mut dying = TestClient::connect(broker.addr).await;
    dying
        .send(&Packet::Connect(Box::new(Connect {
            client_id: "dying".into(),
            will: Some(vibemesh::protocol::Will {
                topic: Bytes::from(format!("{}/status/", key)),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })))
        .await;
    assert!(matches!(
        dying.read_packet(Duration::from_secs(2)).await,
        Some(Packet::ConnAck(_))
    ));
    drop(dying);

    let will = watcher.recv().await;
    assert_eq!(&will.payload[..], b"offline");
}
