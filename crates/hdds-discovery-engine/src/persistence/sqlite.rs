// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite persistence backend
//!
//! Stores proxy records as JSON documents keyed by identity. Every applied
//! fact runs in its own transaction, so a crash mid-write never leaves a
//! partially applied record.
//!
//! Thread-safe via internal Mutex (SQLite Connection is not Sync).
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE participants (
//!     guid_prefix BLOB PRIMARY KEY,
//!     record TEXT NOT NULL
//! );
//! CREATE TABLE endpoints (
//!     guid BLOB PRIMARY KEY,
//!     owner BLOB NOT NULL,
//!     record TEXT NOT NULL
//! );
//! CREATE INDEX idx_endpoint_owner ON endpoints(owner);
//! ```

use super::{persistence_file_name, DiscoveryPersistence, PersistedFact, PersistedSnapshot};
use crate::types::{EndpointRecord, GuidPrefix, ParticipantRecord};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction};
use std::path::Path;

/// SQLite persistence store
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open (or create) a database file.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Open the database of server `prefix` inside `directory`.
    pub fn open_in(directory: &Path, prefix: &GuidPrefix) -> Result<Self> {
        std::fs::create_dir_all(directory).with_context(|| {
            format!(
                "Failed to create persistence directory {}",
                directory.display()
            )
        })?;
        Self::new(&directory.join(persistence_file_name(prefix)))
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS participants (
                 guid_prefix BLOB PRIMARY KEY,
                 record TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS endpoints (
                 guid BLOB PRIMARY KEY,
                 owner BLOB NOT NULL,
                 record TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_endpoint_owner ON endpoints(owner);",
        )
        .context("Failed to initialize discovery persistence schema")?;

        Ok(())
    }

    fn write_participant(tx: &Transaction<'_>, record: &ParticipantRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        tx.execute(
            "INSERT OR REPLACE INTO participants (guid_prefix, record) VALUES (?1, ?2)",
            params![&record.id()[..], json],
        )?;
        if !record.is_alive() {
            tx.execute(
                "DELETE FROM endpoints WHERE owner = ?1",
                params![&record.id()[..]],
            )?;
        }
        Ok(())
    }

    fn write_endpoint(tx: &Transaction<'_>, record: &EndpointRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        tx.execute(
            "INSERT OR REPLACE INTO endpoints (guid, owner, record) VALUES (?1, ?2, ?3)",
            params![&record.guid().to_bytes()[..], &record.owner[..], json],
        )?;
        Ok(())
    }

    fn apply_in(tx: &Transaction<'_>, fact: &PersistedFact) -> Result<()> {
        match fact {
            PersistedFact::Participant(record) => Self::write_participant(tx, record),
            PersistedFact::Endpoint(record) => Self::write_endpoint(tx, record),
            PersistedFact::EndpointRemoved(guid) => {
                tx.execute(
                    "DELETE FROM endpoints WHERE guid = ?1",
                    params![&guid.to_bytes()[..]],
                )?;
                Ok(())
            }
            PersistedFact::ParticipantPurged(prefix) => {
                tx.execute(
                    "DELETE FROM endpoints WHERE owner = ?1",
                    params![&prefix[..]],
                )?;
                tx.execute(
                    "DELETE FROM participants WHERE guid_prefix = ?1",
                    params![&prefix[..]],
                )?;
                Ok(())
            }
        }
    }

    /// Number of persisted participants and endpoints.
    pub fn counts(&self) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let participants: i64 =
            conn.query_row("SELECT COUNT(*) FROM participants", [], |row| row.get(0))?;
        let endpoints: i64 =
            conn.query_row("SELECT COUNT(*) FROM endpoints", [], |row| row.get(0))?;
        Ok((participants as usize, endpoints as usize))
    }
}

impl DiscoveryPersistence for SqlitePersistence {
    fn load(&self) -> Result<Option<PersistedSnapshot>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare("SELECT record FROM participants ORDER BY guid_prefix ASC")?;
        let participants = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|json| -> Result<ParticipantRecord> {
                let json = json?;
                serde_json::from_str(&json).context("Corrupt persisted participant record")
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT record FROM endpoints ORDER BY guid ASC")?;
        let endpoints = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|json| -> Result<EndpointRecord> {
                let json = json?;
                serde_json::from_str(&json).context("Corrupt persisted endpoint record")
            })
            .collect::<Result<Vec<_>>>()?;

        let snapshot = PersistedSnapshot {
            participants,
            endpoints,
        };
        Ok((!snapshot.is_empty()).then_some(snapshot))
    }

    fn apply(&self, fact: &PersistedFact) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::apply_in(&tx, fact)?;
        tx.commit()?;
        Ok(())
    }
}
