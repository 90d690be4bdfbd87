//! Broker Core
//!
//! Wires the service to its storage, cluster and listeners and runs the
//! MQTT accept loop.

mod connection;
mod writer;

pub use connection::{Connection, ConnectionError};
pub use writer::{SendError, SharedWriter};

use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::cluster::{ClusterError, ClusterInboundCallback, ClusterManager, Network, Standalone};
use crate::config::{Config, ConfigError, StorageProvider};
use crate::event::State;
use crate::id;
use crate::metrics::Metrics;
use crate::security::{License, SingleContractProvider};
use crate::service::{self, Dependencies, Service};
use crate::storage::{self, FjallStorage, MemoryStorage, NoopStorage, Storage, StorageError};
use crate::topic::SubscriptionTrie;

#[derive(Debug)]
pub enum BrokerError {
    Io(std::io::Error),
    Config(ConfigError),
    Storage(StorageError),
    Cluster(ClusterError),
    Metrics(prometheus::Error),
    Service(service::Error),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Config(e) => write!(f, "configuration error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Cluster(e) => write!(f, "cluster error: {}", e),
            Self::Metrics(e) => write!(f, "metrics error: {}", e),
            Self::Service(e) => write!(f, "service error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for BrokerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StorageError> for BrokerError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ClusterError> for BrokerError {
    fn from(e: ClusterError) -> Self {
        Self::Cluster(e)
    }
}

impl From<prometheus::Error> for BrokerError {
    fn from(e: prometheus::Error) -> Self {
        Self::Metrics(e)
    }
}

impl From<service::Error> for BrokerError {
    fn from(e: service::Error) -> Self {
        Self::Service(e)
    }
}

/// A broker node
pub struct Broker {
    config: Config,
    service: Arc<Service>,
    storage: Arc<dyn Storage>,
    cluster: Option<Arc<ClusterManager>>,
    connections: Arc<AtomicUsize>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Builds every component; nothing listens until [`Broker::run`].
    pub async fn new(config: Config) -> Result<Self, BrokerError> {
        config.validate()?;

        let license = match config.license.parse()? {
            Some(license) => license,
            None => {
                let license = License::generate();
                let master = license.cipher().encrypt_key(&license.new_master_key(1));
                warn!("No license configured, generated a temporary one");
                warn!("License: {}", license);
                warn!("Master key: {}", master);
                license
            }
        };

        let clock = Clock::System;
        let metrics = Arc::new(Metrics::new()?);
        let state = Arc::new(
            State::new(clock.clone()).with_max_frame_entries(config.cluster.max_frame_entries),
        );
        let trie = Arc::new(SubscriptionTrie::new(config.matching.strategy));
        let storage: Arc<dyn Storage> = match config.storage.provider {
            StorageProvider::Memory => Arc::new(MemoryStorage::with_clock(clock)),
            StorageProvider::Fjall => Arc::new(FjallStorage::open(&config.storage.path)?),
            StorageProvider::Noop => Arc::new(NoopStorage),
        };

        let peer_id = id::peer();
        let cluster = if config.cluster.enabled {
            let manager = ClusterManager::new(
                config.cluster.clone(),
                peer_id,
                state.clone(),
                trie.clone(),
                metrics.clone(),
            )
            .await?;
            Some(Arc::new(manager))
        } else {
            None
        };
        let network: Arc<dyn Network> = match &cluster {
            Some(manager) => manager.clone(),
            None => Arc::new(Standalone::new(peer_id)),
        };

        let service = Service::new(
            &config,
            Dependencies {
                license: license.clone(),
                contracts: Arc::new(SingleContractProvider::new(&license)),
                trie,
                state,
                storage: storage.clone(),
                network,
                metrics,
            },
        );

        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config,
            service,
            storage,
            cluster,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown,
        })
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(self.config.server.bind).await?;
        self.serve(listener).await
    }

    /// Starts background tasks and accepts clients on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        self.service.start(&self.shutdown)?;
        storage::spawn_gc(
            self.storage.clone(),
            self.config.storage.gc_interval,
            self.shutdown.subscribe(),
        );

        if let Some(cluster) = &self.cluster {
            let service = self.service.clone();
            let inbound: ClusterInboundCallback = Arc::new(move |msg| service.on_peer_message(msg));
            cluster.start(inbound, &self.shutdown).await?;
        }

        info!(
            "MQTT/TCP listening on {} (peer {:016x})",
            listener.local_addr()?,
            self.service.peer_id()
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => self.handle_connection(stream, addr),
                    Err(e) => error!("Failed to accept TCP connection: {}", e),
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Broker stopping");
        if let Some(cluster) = &self.cluster {
            cluster.stop().await;
        }
        self.service.shutdown();
        if let Err(e) = self.storage.close().await {
            warn!("Failed to close storage: {}", e);
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let active = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        if active > self.config.server.max_connections {
            self.connections.fetch_sub(1, Ordering::AcqRel);
            warn!("Connection limit reached, rejecting {}", addr);
            return;
        }
        let _ = stream.set_nodelay(true);

        let service = self.service.clone();
        let config = self.config.server.clone();
        let connections = self.connections.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut conn = Connection::new(stream, addr, service, config);
            let conn_fut = AssertUnwindSafe(conn.run()).catch_unwind();
            tokio::pin!(conn_fut);

            tokio::select! {
                result = &mut conn_fut => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Connection error from {}: {}", addr, e),
                    Err(_) => error!("Connection handler for {} panicked", addr),
                },
                _ = shutdown_rx.recv() => debug!("Connection {} shutting down", addr),
            }
            connections.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Stops the accept loop and every background task.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::service::KeyGenRequest;

    /// A standalone service and a read/write key for `a/`.
    pub(crate) fn test_service() -> (Arc<Service>, String) {
        let license = License::v3([9; 32], 1, 1);
        let state = Arc::new(State::new(Clock::System));
        let service = Service::new(
            &Config::default(),
            Dependencies {
                license: license.clone(),
                contracts: Arc::new(SingleContractProvider::new(&license)),
                trie: Arc::new(SubscriptionTrie::default()),
                state,
                storage: Arc::new(MemoryStorage::new()),
                network: Arc::new(Standalone::new(1)),
                metrics: Arc::new(Metrics::new().unwrap()),
            },
        );

        let master = license.cipher().encrypt_key(&license.new_master_key(1));
        let request = KeyGenRequest {
            req: 0,
            key: master,
            channel: "a/".into(),
            access: "rw".into(),
            ttl: 0,
        };
        let (key, _) = service.keygen(&request, "test").unwrap();
        (service, key)
    }

    #[tokio::test]
    async fn test_broker_serves_and_stops() {
        let broker = Arc::new(Broker::new(Config::default()).await.unwrap());
        assert_ne!(broker.service().peer_id(), 0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = broker.clone();
        let handle = tokio::spawn(async move { running.serve(listener).await });

        let _stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while broker.connection_count() == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        broker.shutdown();
        handle.await.unwrap().unwrap();
    }
}
