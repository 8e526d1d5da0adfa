//! gossipd server - main service loop

use crate::bootstrap::{BootstrapSettings, Bootstrapper};
use crate::client::LinkSettings;
use crate::config::Config;
use crate::exchange::Exchange;
use crate::gossip::{Gossip, GossipError, KeyPattern};
use crate::manager::{ConnectionManager, LinkTable, ManagerSettings, IDENTITY_KEYS};
use crate::storage::{Storage, StorageError};
use cluster_gossip_core::{Clock, NodeDescriptor, NodeId, SystemClock};
use cluster_gossip_net::{
    AddrError, Connection, Frame, FrameCodec, FrameType, GossipRequest, GossipResponse,
};
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("Invalid join address: {0}")]
    Join(#[from] AddrError),
}

/// Stops a running server from another task
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub node_id: NodeId,
    pub infos: usize,
    pub known_nodes: usize,
    pub outgoing_links: usize,
    pub incoming_links: usize,
    pub identity_conflicts: u64,
}

/// A bound gossip node
pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    gossip: Arc<Gossip>,
    exchange: Arc<Exchange>,
    links: Arc<LinkTable>,
    listener: TcpListener,
    local_addr: SocketAddr,
    descriptor: NodeDescriptor,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Open storage, recover identity and bind the listener
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);

        let node_id = match (config.node_id, storage.node_id()?) {
            (Some(id), _) => NodeId(id),
            (None, Some(id)) => id,
            (None, None) => NodeId(rand::thread_rng().gen_range(1..=u32::MAX)),
        };
        storage.put_node_id(node_id)?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let started_at = clock.now();
        let gossip = Arc::new(Gossip::new(node_id, clock, config.max_hops));
        for key in IDENTITY_KEYS {
            if let Some(value) = storage.identity(key)? {
                info!(key, value = %String::from_utf8_lossy(&value), "Recovered durable identity");
                gossip.pin(key, value);
            }
        }

        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        let advertise = config
            .advertise
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let exchange = Arc::new(Exchange::new(
            gossip.clone(),
            advertise.clone(),
            config.max_delta_infos,
        ));
        let descriptor = NodeDescriptor {
            node_id,
            address: advertise,
            attrs: config.attrs.clone(),
            started_at,
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            storage,
            gossip,
            exchange,
            links: Arc::new(LinkTable::default()),
            listener,
            local_addr,
            descriptor,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> NodeId {
        self.descriptor.node_id
    }

    pub fn advertise_addr(&self) -> &str {
        &self.descriptor.address
    }

    pub fn gossip(&self) -> Arc<Gossip> {
        self.gossip.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            node_id: self.node_id(),
            infos: self.gossip.len(),
            known_nodes: self.gossip.peer_count(),
            outgoing_links: self.links.active_count(),
            incoming_links: self.links.incoming_count(),
            identity_conflicts: self.gossip.conflicts(),
        }
    }

    fn manager(&self) -> Result<ConnectionManager, ServerError> {
        let config = &self.config;
        let mut self_addrs = vec![self.local_addr];
        if let Ok(advertised) = self.descriptor.address.parse() {
            self_addrs.push(advertised);
        }
        let bootstrapper = Bootstrapper::new(
            self.exchange.clone(),
            self.storage.clone(),
            BootstrapSettings {
                join: config.join.clone(),
                may_found: config.may_found(),
                rpc_timeout: config.rpc_timeout(),
                identity_ttl: config.identity_ttl(),
                backoff_base: config.backoff_base(),
                backoff_max: config.backoff_max(),
            },
            self_addrs,
        )?;
        let settings = ManagerSettings {
            max_fanout: config.max_fanout,
            tick_interval: config.tick_interval(),
            node_ttl: config.node_ttl(),
            identity_ttl: config.identity_ttl(),
            max_persisted_peers: config.max_persisted_peers,
            link: LinkSettings {
                gossip_interval: config.gossip_interval(),
                rpc_timeout: config.rpc_timeout(),
                backoff_base: config.backoff_base(),
                backoff_max: config.backoff_max(),
                max_failures: config.max_link_failures,
            },
        };
        Ok(ConnectionManager::new(
            self.exchange.clone(),
            self.storage.clone(),
            bootstrapper,
            self.links.clone(),
            settings,
            self.descriptor.clone(),
        ))
    }

    /// Run until the shutdown handle fires
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            node = %self.node_id(),
            listen = %self.local_addr,
            advertise = %self.descriptor.address,
            "Starting gossipd"
        );

        let dispatcher = self.gossip.spawn_dispatcher();

        // Identity values are durable from the moment they are first seen
        let subscriptions: Vec<_> = IDENTITY_KEYS
            .iter()
            .map(|key| {
                let storage = self.storage.clone();
                self.gossip
                    .subscribe(KeyPattern::Exact(key.to_string()), move |key, value| {
                        match storage.put_identity(key, value) {
                            Ok(true) => info!(key, "Persisted cluster identity"),
                            Ok(false) => {}
                            Err(e) => error!(key, "Failed to persist cluster identity: {}", e),
                        }
                    })
            })
            .collect();
        self.gossip
            .refresh_identity(&IDENTITY_KEYS, self.config.identity_ttl())?;

        let manager = self.manager()?;
        let manager_handle = tokio::spawn(manager.run(self.shutdown_tx.subscribe()));

        let permits = Arc::new(Semaphore::new(self.config.max_incoming));
        let mut incoming = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(peer = %addr, "Accepted connection");
                            let handler = self.incoming_handler();
                            let shutdown = self.shutdown_tx.subscribe();
                            match permits.clone().try_acquire_owned() {
                                Ok(permit) => {
                                    incoming.spawn(handler.serve(stream, addr, permit, shutdown));
                                }
                                Err(_) => {
                                    incoming.spawn(handler.refuse(stream, addr));
                                }
                            }
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = incoming.join_next(), if !incoming.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        info!("Shutting down...");
        if let Err(e) = manager_handle.await {
            warn!("Connection manager task failed: {}", e);
        }
        while incoming.join_next().await.is_some() {}
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        for id in subscriptions {
            self.gossip.unsubscribe(id);
        }
        // Changes still queued for the dispatcher were dropped with it
        for key in IDENTITY_KEYS {
            if let Some(value) = self.gossip.pinned(key) {
                self.storage.put_identity(key, &value)?;
            }
        }

        self.storage.flush()?;
        info!(node = %self.node_id(), "gossipd stopped");
        Ok(())
    }

    fn incoming_handler(&self) -> IncomingHandler {
        let config = &self.config;
        IncomingHandler {
            exchange: self.exchange.clone(),
            links: self.links.clone(),
            rpc_timeout: config.rpc_timeout(),
            idle_timeout: config.gossip_interval() * 3 + config.rpc_timeout(),
        }
    }
}

/// Serves exchange requests on one accepted connection
struct IncomingHandler {
    exchange: Arc<Exchange>,
    links: Arc<LinkTable>,
    rpc_timeout: Duration,
    idle_timeout: Duration,
}

impl IncomingHandler {
    async fn serve(
        self,
        stream: TcpStream,
        addr: SocketAddr,
        _permit: OwnedSemaphorePermit,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.links.register_incoming(addr);
        let mut conn = Connection::new(stream, addr, FrameCodec::new());

        loop {
            let frame = tokio::select! {
                frame = conn.recv(self.idle_timeout) => frame,
                _ = shutdown.changed() => break,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(peer = %addr, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    debug!(peer = %addr, "Incoming connection ended: {}", e);
                    break;
                }
            };

            let reply = match frame.frame_type {
                FrameType::Ping => Frame::pong(),
                FrameType::GossipRequest => match GossipRequest::from_frame(&frame) {
                    Ok(request) => {
                        self.links.identify_incoming(addr, request.node_id);
                        match self.exchange.handle_request(request).to_frame() {
                            Ok(frame) => frame,
                            Err(e) => {
                                error!(peer = %addr, "Failed to encode response: {}", e);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer = %addr, "Dropping connection, malformed request: {}", e);
                        break;
                    }
                },
                other => {
                    debug!(peer = %addr, frame_type = ?other, "Ignoring unexpected frame");
                    continue;
                }
            };
            if let Err(e) = conn.send(reply, self.rpc_timeout).await {
                debug!(peer = %addr, "Failed to answer: {}", e);
                break;
            }
        }

        self.links.drop_incoming(addr);
    }

    /// Answer the first request with a redirect to some other known node
    async fn refuse(self, stream: TcpStream, addr: SocketAddr) {
        let mut conn = Connection::new(stream, addr, FrameCodec::new());
        let requester = match conn.recv(self.rpc_timeout).await {
            Ok(Some(frame)) if frame.frame_type == FrameType::GossipRequest => {
                match GossipRequest::from_frame(&frame) {
                    Ok(request) => request.node_id,
                    Err(_) => return,
                }
            }
            _ => return,
        };

        let own = self.exchange.node_id();
        let alternates: Vec<String> = self
            .exchange
            .gossip()
            .known_nodes()
            .into_iter()
            .filter(|node| node.descriptor.node_id != own && node.descriptor.node_id != requester)
            .map(|node| node.descriptor.address)
            .collect();
        let alternate = alternates.choose(&mut rand::thread_rng()).cloned();
        info!(peer = %addr, alternate = ?alternate, "Incoming links full, redirecting");

        let redirect =
            GossipResponse::redirect(own, self.exchange.addr().to_string(), alternate);
        if let Ok(frame) = redirect.to_frame() {
            let _ = conn.send(frame, self.rpc_timeout).await;
        }
    }
}
