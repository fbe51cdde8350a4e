// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistence adapter
//!
//! Optional durable copy of the proxy store so a restarted server does not
//! force a full re-discovery of the mesh. Persistence is a durability
//! optimization: the in-memory store stays authoritative for the running
//! process, and a failing backend only downgrades the engine to in-memory
//! operation.
//!
//! # Architecture
//!
//! ```text
//! DiscoveryController
//! +-- PersistenceWorker      (dedicated thread, never blocks discovery)
//!     +-- DiscoveryPersistence
//!         +-- SqlitePersistence   (file per server: server-<guidprefix>.db)
//!         +-- NoopPersistence     (persistence disabled)
//! ```

pub mod sqlite;
pub mod worker;

pub use sqlite::SqlitePersistence;
pub use worker::PersistenceWorker;

use crate::types::{prefix_to_hex, EndpointRecord, Guid, GuidPrefix, ParticipantRecord};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Durable copy of the proxy store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub participants: Vec<ParticipantRecord>,
    pub endpoints: Vec<EndpointRecord>,
}

impl PersistedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty() && self.endpoints.is_empty()
    }
}

/// One durable change. Each is applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PersistedFact {
    /// Participant created, updated or retired. A retired participant's
    /// endpoints are deleted in the same transaction.
    Participant(ParticipantRecord),
    /// Endpoint created or updated.
    Endpoint(EndpointRecord),
    /// Endpoint disposed.
    EndpointRemoved(Guid),
    /// Participant trimmed for good.
    ParticipantPurged(GuidPrefix),
}

/// Persistence backend trait
///
/// Backends must make every `apply` crash-atomic and idempotent: applying
/// the same fact twice leaves the same state as applying it once.
pub trait DiscoveryPersistence: Send + Sync {
    /// Load the persisted store, `None` when nothing was persisted.
    fn load(&self) -> Result<Option<PersistedSnapshot>>;

    /// Durably apply one change.
    fn apply(&self, fact: &PersistedFact) -> Result<()>;
}

/// Backend used when persistence is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

impl DiscoveryPersistence for NoopPersistence {
    fn load(&self) -> Result<Option<PersistedSnapshot>> {
        Ok(None)
    }

    fn apply(&self, _fact: &PersistedFact) -> Result<()> {
        Ok(())
    }
}

/// Database file name for a server.
pub fn persistence_file_name(prefix: &GuidPrefix) -> String {
    format!("server-{}.db", prefix_to_hex(prefix))
}
