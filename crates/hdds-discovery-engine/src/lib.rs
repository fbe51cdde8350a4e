// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Discovery Server Engine
//!
//! Server side of DDS discovery: a central server keeps a database of every
//! known participant and endpoint, synchronizes it with its clients and peer
//! servers, and tracks which peer has acknowledged which discovery change so
//! state can be resent until seen and trimmed once nobody needs it.
//!
//! # Features
//!
//! - **Proxy Store** -- participants and endpoints keyed by GUID, sequence-checked
//! - **Visibility Matrix** -- per-peer acknowledgment of every discovery fact
//! - **Sync Scheduler** -- periodic re-announcement and trimming, early wake-up
//! - **Persistence** -- optional SQLite copy restored on restart
//! - **TCP Service** -- length-prefixed JSON links to clients and peer servers
//!
//! # Architecture
//!
//! ```text
//! DiscoveryService (TCP)
//! +-- DiscoveryDriver          (boundary validation, acks)
//!     +-- DiscoveryController  (DiscoveryProtocol + SyncTask)
//!         +-- ProxyStore
//!         +-- VisibilityMatrix
//!         +-- PersistenceWorker -> DiscoveryPersistence
//!         +-- EndpointHost / Announcer (host callbacks)
//! +-- SyncScheduler            (drives DiscoveryController::sync)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hdds_discovery_engine::{DiscoveryService, LoggingHost, ServerConfig};
//! use std::sync::Arc;
//!
//! let service = DiscoveryService::new(ServerConfig::default(), Arc::new(LoggingHost))?;
//! service.run().await?;
//! ```

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod host;
pub mod message;
pub mod persistence;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
pub mod visibility;

pub use config::{ConfigError, PersistenceConfig, RemoteServer, ServerConfig};
pub use controller::{DiscoveryController, EngineSettings};
pub use driver::{DiscoveryDriver, DiscoveryProtocol, DriverStats, Handled};
pub use error::EngineError;
pub use host::{Announcer, EndpointHost, HostError, LoggingHost};
pub use message::{InboundMessage, OutboundMessage};
pub use persistence::{
    persistence_file_name, DiscoveryPersistence, NoopPersistence, PersistedFact,
    PersistedSnapshot, PersistenceWorker, SqlitePersistence,
};
pub use scheduler::{Awakener, SyncReport, SyncScheduler, SyncTask};
pub use server::{DiscoveryService, PeerRouter, ServerError};
pub use store::{ProxyStore, Rejection, StoreSnapshot};
pub use types::{
    EndpointData, EndpointKind, EndpointRecord, EntityId, Guid, GuidPrefix, Origin,
    ParticipantData, ParticipantRecord, ParticipantRole, ParticipantStatus, RemovalReason,
};
pub use visibility::{AckState, Fact, FactId, FactKind, Subject, VisibilityMatrix};
