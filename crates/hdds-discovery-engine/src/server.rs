// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP service hosting the discovery engine.
//!
//! Clients and peer servers connect over length-prefixed JSON links (see
//! [`protocol`]). Every inbound message goes through the
//! [`DiscoveryDriver`]; changes carrying a fact id are acknowledged on the
//! same link. A link is routed to the first peer that announces itself on
//! it, and the controller's outbound traffic reaches peers through the
//! [`PeerRouter`].

use crate::config::{ConfigError, RemoteServer, ServerConfig};
use crate::controller::DiscoveryController;
use crate::driver::DiscoveryDriver;
use crate::error::EngineError;
use crate::host::EndpointHost;
use crate::message::InboundMessage;
use crate::persistence::{DiscoveryPersistence, NoopPersistence, SqlitePersistence};
use crate::scheduler::SyncScheduler;
use crate::types::{prefix_to_hex, GuidPrefix, ParticipantData};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod protocol;
pub mod router;

use protocol::{WireMessage, ERROR_MALFORMED};
pub use router::{PeerRouter, RouterStats};

/// Outbound queue depth per link.
const LINK_QUEUE_DEPTH: usize = 256;

/// Discovery Server: the engine plus its TCP transport.
#[derive(Clone)]
pub struct DiscoveryService {
    config: Arc<ServerConfig>,
    local: ParticipantData,
    router: Arc<PeerRouter>,
    controller: Arc<DiscoveryController>,
    driver: Arc<DiscoveryDriver<DiscoveryController>>,
    scheduler: Arc<SyncScheduler>,
    /// Stops the accept loop.
    stop: Arc<Notify>,
    /// Closes every link once the departure has been announced.
    links_closed: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl DiscoveryService {
    /// Build the service. Nothing runs until [`run`](Self::run).
    pub fn new(config: ServerConfig, host: Arc<dyn EndpointHost>) -> Result<Self, ServerError> {
        config.validate()?;
        let prefix = config.guid_prefix()?;

        let backend: Arc<dyn DiscoveryPersistence> =
            match (config.persistence.enabled, &config.persistence.directory) {
                (true, Some(directory)) => match SqlitePersistence::open_in(directory, &prefix) {
                    Ok(store) => {
                        info!("Persistence enabled in {}", directory.display());
                        Arc::new(store)
                    }
                    Err(e) => {
                        warn!("Persistence unavailable, running in memory: {:#}", e);
                        Arc::new(NoopPersistence)
                    }
                },
                _ => Arc::new(NoopPersistence),
            };

        let router = Arc::new(PeerRouter::new());
        let controller = Arc::new(DiscoveryController::new(
            config.engine_settings(),
            host,
            router.clone(),
            backend,
        ));
        let driver = Arc::new(DiscoveryDriver::new(controller.clone()));
        let scheduler = Arc::new(SyncScheduler::new(
            config.sync_period(),
            controller.awakener(),
        ));
        let (links_closed, _) = watch::channel(false);

        Ok(Self {
            local: config.local_participant(prefix),
            config: Arc::new(config),
            router,
            controller,
            driver,
            scheduler,
            stop: Arc::new(Notify::new()),
            links_closed: Arc::new(links_closed),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.listen_address();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        let result = self.serve(listener).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            "Discovery server {} listening on {}",
            prefix_to_hex(&self.local.guid_prefix),
            listener.local_addr()?
        );

        self.driver.start(self.local.clone())?;
        self.scheduler.start(self.controller.clone());

        for remote in &self.config.remote_servers {
            let prefix = remote.prefix()?;
            tokio::spawn(self.clone().connect_loop(remote.clone(), prefix));
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);
                            tokio::spawn(self.clone().serve_link(stream, peer_addr, None));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.stop.notified() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Departure goes out while links are still routed
        self.driver.shutdown();
        self.links_closed.send_replace(true);
        self.scheduler.stop().await;
        self.router.clear();
        self.controller.close().await;
        info!("Discovery server stopped");
        Ok(())
    }

    /// Keep a link to a configured remote server open, reconnecting on loss.
    async fn connect_loop(self, remote: RemoteServer, prefix: GuidPrefix) {
        let retry = self.config.connect_retry();
        let mut closed = self.links_closed.subscribe();
        loop {
            if *closed.borrow() {
                break;
            }
            match TcpStream::connect(remote.address).await {
                Ok(stream) => {
                    info!(
                        "Connected to remote server {} at {}",
                        remote.guid_prefix, remote.address
                    );
                    self.clone()
                        .serve_link(stream, remote.address, Some(prefix))
                        .await;
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", remote.address, e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = closed.changed() => break,
            }
        }
    }

    /// Serve one link until it closes or the service shuts down.
    ///
    /// `remote` is set for outgoing links, whose peer is known up front.
    async fn serve_link(self, stream: TcpStream, peer_addr: SocketAddr, remote: Option<GuidPrefix>) {
        let (mut reader, mut writer) = connection::split(stream, self.config.max_message_size);
        let (tx, mut rx) = mpsc::channel::<WireMessage>(LINK_QUEUE_DEPTH);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = writer.send_message(&message).await {
                    debug!("Write to {} failed: {}", peer_addr, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut identity = remote;
        if let Some(prefix) = remote {
            self.router.register(prefix, tx.clone());
            if let Some(announcement) = self.controller.local_announcement() {
                let _ = tx.try_send(announcement.into());
            }
        }

        let mut closed = self.links_closed.subscribe();
        if !*closed.borrow() {
            loop {
                tokio::select! {
                    result = reader.read_message() => {
                        match result {
                            Ok(Some(message)) => {
                                self.on_message(message, &tx, &mut identity, peer_addr);
                            }
                            Ok(None) => {
                                info!("Connection closed: {}", peer_addr);
                                break;
                            }
                            Err(e) => {
                                warn!("Read error from {}: {}", peer_addr, e);
                                break;
                            }
                        }
                    }
                    _ = closed.changed() => {
                        debug!("Closing link to {}", peer_addr);
                        break;
                    }
                }
            }
        }

        if let Some(prefix) = identity {
            self.router.unregister_if(&prefix, &tx);
        }
        drop(tx);
        if let Err(e) = writer_task.await {
            debug!("Writer task for {} failed: {}", peer_addr, e);
        }
    }

    fn on_message(
        &self,
        message: WireMessage,
        tx: &mpsc::Sender<WireMessage>,
        identity: &mut Option<GuidPrefix>,
        peer_addr: SocketAddr,
    ) {
        if let WireMessage::Error { code, message } = &message {
            warn!("Received error from {}: {} - {}", peer_addr, code, message);
            return;
        }

        let inbound = match message.into_inbound() {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Malformed message from {}: {}", peer_addr, e);
                let _ = tx.try_send(WireMessage::Error {
                    code: ERROR_MALFORMED,
                    message: e.to_string(),
                });
                return;
            }
        };

        // The first peer announcing itself owns the link
        if identity.is_none() {
            if let InboundMessage::ParticipantData { data, .. } = &inbound {
                if data.role.is_peer() && data.validate().is_ok() {
                    info!(
                        "Link {} identified as {:?} {}",
                        peer_addr,
                        data.role,
                        prefix_to_hex(&data.guid_prefix)
                    );
                    self.router.register(data.guid_prefix, tx.clone());
                    *identity = Some(data.guid_prefix);
                }
            }
        }

        let inbound = attribute_ack(inbound, *identity, peer_addr);
        let handled = self.driver.handle(inbound);
        if let (Some(change), Some(local)) = (handled.ack, self.controller.local_prefix()) {
            if tx.try_send(WireMessage::ack(&local, vec![change])).is_err() {
                debug!("Ack for change {} to {} dropped", change, peer_addr);
            }
        }
    }

    /// Signal the service to shut down.
    pub fn shutdown(&self) {
        self.stop.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_prefix(&self) -> GuidPrefix {
        self.local.guid_prefix
    }

    pub fn controller(&self) -> &Arc<DiscoveryController> {
        &self.controller
    }

    pub fn driver(&self) -> &Arc<DiscoveryDriver<DiscoveryController>> {
        &self.driver
    }

    pub fn router(&self) -> &Arc<PeerRouter> {
        &self.router
    }

    pub fn participant_count(&self) -> usize {
        self.controller.store().participant_count()
    }
}

/// Acks on an identified link count for the link's peer, whatever the payload claims.
fn attribute_ack(
    inbound: InboundMessage,
    identity: Option<GuidPrefix>,
    peer_addr: SocketAddr,
) -> InboundMessage {
    match (inbound, identity) {
        (InboundMessage::Ack { from, changes }, Some(owner)) if from != owner => {
            warn!(
                "Ack from {} claims {}, counted for {}",
                peer_addr,
                prefix_to_hex(&from),
                prefix_to_hex(&owner)
            );
            InboundMessage::Ack {
                from: owner,
                changes,
            }
        }
        (inbound, _) => inbound,
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}
