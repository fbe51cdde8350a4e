// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy store: every known participant and endpoint, keyed by identity.
//!
//! Records are immutable once published and replaced wholesale on mutation
//! (`Arc` swap under the write lock), so readers holding a record or a
//! [`StoreSnapshot`] never observe a half-applied change.
//!
//! Invariants maintained here:
//! - every endpoint's owner exists and is alive,
//! - participant sequence numbers only move forward,
//! - the local participant is never retired nor purged.

use crate::persistence::PersistedSnapshot;
use crate::types::{
    prefix_to_hex, EndpointData, EndpointRecord, Guid, GuidPrefix, Origin, ParticipantData,
    ParticipantRecord, ParticipantStatus, RemovalReason,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why a mutation was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Sequence number older than the applied one.
    Stale,
    /// Same sequence number as the applied one.
    Duplicate,
    /// Endpoint owner unknown or not alive.
    UnknownOwner,
    /// Mutation targets the local participant.
    Protected,
    /// Participant or endpoint limit reached.
    CapacityExceeded,
}

/// Outcome of an upsert.
#[derive(Debug, Clone)]
pub enum Upsert<T> {
    Applied {
        record: Arc<T>,
        created: bool,
    },
    Rejected {
        reason: Rejection,
        /// Record left untouched, if one exists.
        current: Option<Arc<T>>,
    },
}

impl<T> Upsert<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::Applied { .. } => None,
            Self::Rejected { reason, .. } => Some(*reason),
        }
    }
}

/// Outcome of retiring a participant (status moves away from `Alive`).
#[derive(Debug, Clone)]
pub enum Retirement {
    Retired {
        record: Arc<ParticipantRecord>,
        /// Endpoints deleted together with the participant.
        endpoints: Vec<Arc<EndpointRecord>>,
    },
    Rejected(Rejection),
    NotFound,
}

/// Result of restoring persisted records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub participants: usize,
    pub endpoints: usize,
    /// Endpoints dropped because their owner was missing or not alive.
    pub orphans: usize,
}

#[derive(Debug, Clone, Copy)]
struct Liveliness {
    last_seen: Instant,
    status_since: Instant,
}

impl Liveliness {
    fn now() -> Self {
        let now = Instant::now();
        Self {
            last_seen: now,
            status_since: now,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    participants: BTreeMap<GuidPrefix, Arc<ParticipantRecord>>,
    endpoints: BTreeMap<Guid, Arc<EndpointRecord>>,
    liveliness: HashMap<GuidPrefix, Liveliness>,
}

impl StoreState {
    fn endpoint_range(&self, owner: &GuidPrefix) -> impl Iterator<Item = &Arc<EndpointRecord>> {
        let low = Guid::new(*owner, [0x00; 4]);
        let high = Guid::new(*owner, [0xff; 4]);
        self.endpoints.range(low..=high).map(|(_, record)| record)
    }
}

/// Proxy store shared by the controller and the sync scheduler.
#[derive(Debug)]
pub struct ProxyStore {
    inner: RwLock<StoreState>,
    max_participants: usize,
    max_endpoints_per_participant: usize,
}

impl ProxyStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::with_limits(usize::MAX, usize::MAX)
    }

    /// Create a store enforcing participant and per-participant endpoint limits.
    pub fn with_limits(max_participants: usize, max_endpoints_per_participant: usize) -> Self {
        Self {
            inner: RwLock::new(StoreState::default()),
            max_participants,
            max_endpoints_per_participant,
        }
    }

    /// Insert or refresh the local participant.
    pub fn insert_local(&self, data: ParticipantData, sequence: u64) -> Arc<ParticipantRecord> {
        let id = data.guid_prefix;
        let mut state = self.inner.write();
        let endpoints = state
            .participants
            .get(&id)
            .map(|current| current.endpoints.clone())
            .unwrap_or_default();
        let record = Arc::new(ParticipantRecord {
            data,
            origin: Origin::Local,
            sequence,
            writer: Guid::spdp_writer(id),
            endpoints,
            status: ParticipantStatus::Alive,
        });
        state.participants.insert(id, Arc::clone(&record));
        state.liveliness.insert(id, Liveliness::now());
        record
    }

    /// Apply a DATA(p). Sequence numbers must strictly increase per identity.
    ///
    /// A duplicate still refreshes the lease of an alive participant, since
    /// periodic re-sends of the last change are how liveliness is asserted.
    pub fn upsert_participant(
        &self,
        data: ParticipantData,
        sequence: u64,
        writer: Guid,
    ) -> Upsert<ParticipantRecord> {
        let id = data.guid_prefix;
        let now = Instant::now();
        let mut state = self.inner.write();

        let Some(current) = state.participants.get(&id).cloned() else {
            if state.participants.len() >= self.max_participants {
                return Upsert::Rejected {
                    reason: Rejection::CapacityExceeded,
                    current: None,
                };
            }
            let record = Arc::new(ParticipantRecord {
                data,
                origin: Origin::Remote,
                sequence,
                writer,
                endpoints: BTreeSet::new(),
                status: ParticipantStatus::Alive,
            });
            state.participants.insert(id, Arc::clone(&record));
            state.liveliness.insert(id, Liveliness::now());
            return Upsert::Applied {
                record,
                created: true,
            };
        };

        if current.is_local() {
            return Upsert::Rejected {
                reason: Rejection::Protected,
                current: Some(current),
            };
        }
        if sequence <= current.sequence {
            let reason = if sequence == current.sequence {
                if current.is_alive() {
                    if let Some(live) = state.liveliness.get_mut(&id) {
                        live.last_seen = now;
                    }
                }
                Rejection::Duplicate
            } else {
                Rejection::Stale
            };
            return Upsert::Rejected {
                reason,
                current: Some(current),
            };
        }

        let mut next = (*current).clone();
        next.data = data;
        next.sequence = sequence;
        next.writer = writer;
        let live = state.liveliness.entry(id).or_insert_with(Liveliness::now);
        live.last_seen = now;
        if !next.is_alive() {
            debug!("Participant {} revived by newer data", prefix_to_hex(&id));
            next.status = ParticipantStatus::Alive;
            live.status_since = now;
        }
        let record = Arc::new(next);
        state.participants.insert(id, Arc::clone(&record));
        Upsert::Applied {
            record,
            created: false,
        }
    }

    /// Move a participant out of `Alive`, deleting its endpoints.
    ///
    /// When `sequence` is given (disposal message) it must be newer than the
    /// applied one. A disposal may follow a lease expiry, not the reverse.
    pub fn retire_participant(
        &self,
        id: &GuidPrefix,
        reason: RemovalReason,
        sequence: Option<u64>,
    ) -> Retirement {
        let mut state = self.inner.write();
        let Some(current) = state.participants.get(id).cloned() else {
            return Retirement::NotFound;
        };
        if current.is_local() {
            return Retirement::Rejected(Rejection::Protected);
        }
        if let Some(seq) = sequence {
            if seq < current.sequence {
                return Retirement::Rejected(Rejection::Stale);
            }
            if seq == current.sequence {
                return Retirement::Rejected(Rejection::Duplicate);
            }
        }

        let target = reason.status();
        match (current.status, target) {
            (from, to) if from == to => return Retirement::Rejected(Rejection::Duplicate),
            (ParticipantStatus::Removed, ParticipantStatus::Dropped) => {
                return Retirement::Rejected(Rejection::Duplicate)
            }
            _ => {}
        }

        let endpoints: Vec<Arc<EndpointRecord>> = current
            .endpoints
            .iter()
            .filter_map(|guid| state.endpoints.remove(guid))
            .collect();

        let mut next = (*current).clone();
        next.status = target;
        next.endpoints.clear();
        if let Some(seq) = sequence {
            next.sequence = seq;
        }
        let record = Arc::new(next);
        state.participants.insert(*id, Arc::clone(&record));
        state
            .liveliness
            .entry(*id)
            .or_insert_with(Liveliness::now)
            .status_since = Instant::now();

        Retirement::Retired { record, endpoints }
    }

    /// Contract form of [`Self::retire_participant`] without a sequence check.
    pub fn remove_participant(&self, id: &GuidPrefix, reason: RemovalReason) -> bool {
        matches!(
            self.retire_participant(id, reason, None),
            Retirement::Retired { .. }
        )
    }

    /// Apply a DATA(w)/DATA(r). The owner must exist and be alive.
    pub fn upsert_endpoint(
        &self,
        owner: &GuidPrefix,
        data: EndpointData,
        sequence: u64,
    ) -> Upsert<EndpointRecord> {
        let guid = data.guid;
        let mut state = self.inner.write();

        let owner_record = match state.participants.get(owner) {
            Some(record) if record.is_alive() && guid.prefix == *owner => Arc::clone(record),
            _ => {
                return Upsert::Rejected {
                    reason: Rejection::UnknownOwner,
                    current: None,
                }
            }
        };

        if let Some(current) = state.endpoints.get(&guid).cloned() {
            if sequence <= current.sequence {
                let reason = if sequence == current.sequence {
                    Rejection::Duplicate
                } else {
                    Rejection::Stale
                };
                return Upsert::Rejected {
                    reason,
                    current: Some(current),
                };
            }
            let record = Arc::new(EndpointRecord {
                data,
                owner: *owner,
                sequence,
                matched: current.matched,
            });
            state.endpoints.insert(guid, Arc::clone(&record));
            return Upsert::Applied {
                record,
                created: false,
            };
        }

        if owner_record.endpoints.len() >= self.max_endpoints_per_participant {
            return Upsert::Rejected {
                reason: Rejection::CapacityExceeded,
                current: None,
            };
        }

        let record = Arc::new(EndpointRecord {
            data,
            owner: *owner,
            sequence,
            matched: false,
        });
        state.endpoints.insert(guid, Arc::clone(&record));

        let mut next_owner = (*owner_record).clone();
        next_owner.endpoints.insert(guid);
        state.participants.insert(*owner, Arc::new(next_owner));

        Upsert::Applied {
            record,
            created: true,
        }
    }

    /// Delete an endpoint. With a sequence, only if it is newer than the applied one.
    pub fn retire_endpoint(&self, guid: &Guid, sequence: Option<u64>) -> Option<Arc<EndpointRecord>> {
        let mut state = self.inner.write();
        let current = state.endpoints.get(guid)?;
        if sequence.is_some_and(|seq| seq <= current.sequence) {
            return None;
        }
        let removed = state.endpoints.remove(guid)?;
        if let Some(owner) = state.participants.get(&removed.owner).cloned() {
            let mut next = (*owner).clone();
            next.endpoints.remove(guid);
            state.participants.insert(removed.owner, Arc::new(next));
        }
        Some(removed)
    }

    /// Contract form of [`Self::retire_endpoint`].
    pub fn remove_endpoint(&self, guid: &Guid) -> bool {
        self.retire_endpoint(guid, None).is_some()
    }

    /// Delete a retired remote participant for good.
    pub fn purge_participant(&self, id: &GuidPrefix) -> Option<Arc<ParticipantRecord>> {
        let mut state = self.inner.write();
        match state.participants.get(id) {
            Some(record) if !record.is_local() && !record.is_alive() => {}
            _ => return None,
        }
        let stray: Vec<Guid> = state.endpoint_range(id).map(|e| e.guid()).collect();
        for guid in stray {
            state.endpoints.remove(&guid);
        }
        state.liveliness.remove(id);
        state.participants.remove(id)
    }

    /// Get a participant by GUID prefix.
    pub fn participant(&self, id: &GuidPrefix) -> Option<Arc<ParticipantRecord>> {
        self.inner.read().participants.get(id).cloned()
    }

    /// Get an endpoint by GUID.
    pub fn endpoint(&self, guid: &Guid) -> Option<Arc<EndpointRecord>> {
        self.inner.read().endpoints.get(guid).cloned()
    }

    /// Endpoints owned by a participant.
    pub fn endpoints_of(&self, owner: &GuidPrefix) -> Vec<Arc<EndpointRecord>> {
        self.inner.read().endpoint_range(owner).cloned().collect()
    }

    /// Refresh the lease of an alive participant.
    pub fn touch(&self, id: &GuidPrefix) -> bool {
        let mut state = self.inner.write();
        let alive = state.participants.get(id).is_some_and(|p| p.is_alive());
        if !alive {
            return false;
        }
        if let Some(live) = state.liveliness.get_mut(id) {
            live.last_seen = Instant::now();
        }
        true
    }

    /// Alive remote participants whose lease ran out at `now`.
    pub fn expired(&self, now: Instant) -> Vec<GuidPrefix> {
        let state = self.inner.read();
        state
            .participants
            .values()
            .filter(|p| !p.is_local() && p.is_alive())
            .filter(|p| {
                state.liveliness.get(&p.id()).is_some_and(|live| {
                    now.saturating_duration_since(live.last_seen) > p.data.lease_duration
                })
            })
            .map(|p| p.id())
            .collect()
    }

    /// Retired remote participants whose status has been stable for at least `grace` at `now`.
    pub fn retired_for(&self, grace: Duration, now: Instant) -> Vec<Arc<ParticipantRecord>> {
        let state = self.inner.read();
        state
            .participants
            .values()
            .filter(|p| !p.is_local() && !p.is_alive())
            .filter(|p| {
                state
                    .liveliness
                    .get(&p.id())
                    .map_or(true, |live| now.saturating_duration_since(live.status_since) >= grace)
            })
            .cloned()
            .collect()
    }

    /// Update the matched hint on every endpoint of `owner`. Returns how many changed.
    pub fn set_endpoints_matched(&self, owner: &GuidPrefix, matched: bool) -> usize {
        let mut state = self.inner.write();
        let changed: Vec<Arc<EndpointRecord>> = state
            .endpoint_range(owner)
            .filter(|e| e.matched != matched)
            .map(|e| {
                let mut next = (**e).clone();
                next.matched = matched;
                Arc::new(next)
            })
            .collect();
        let count = changed.len();
        for record in changed {
            state.endpoints.insert(record.guid(), record);
        }
        count
    }

    /// Consistent point-in-time view of every record.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.inner.read();
        StoreSnapshot {
            participants: state.participants.values().cloned().collect(),
            endpoints: state.endpoints.values().cloned().collect(),
        }
    }

    /// Rebuild remote records from a persisted snapshot.
    ///
    /// Records for `local` are skipped; the local participant is always
    /// re-created from the running configuration.
    pub fn restore(&self, snapshot: &PersistedSnapshot, local: &GuidPrefix) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut state = self.inner.write();

        for persisted in &snapshot.participants {
            let id = persisted.id();
            if id == *local {
                continue;
            }
            let mut record = persisted.clone();
            record.origin = Origin::Remote;
            record.endpoints.clear();
            state.participants.insert(id, Arc::new(record));
            state.liveliness.insert(id, Liveliness::now());
            report.participants += 1;
        }

        for persisted in &snapshot.endpoints {
            let owner = match state.participants.get(&persisted.owner) {
                Some(owner)
                    if owner.is_alive() && !owner.is_local() && persisted.guid().prefix == owner.id() =>
                {
                    Arc::clone(owner)
                }
                _ => {
                    warn!(
                        "Dropping orphaned persisted endpoint {} (owner {})",
                        persisted.guid(),
                        prefix_to_hex(&persisted.owner)
                    );
                    report.orphans += 1;
                    continue;
                }
            };
            let mut record = persisted.clone();
            record.matched = false;
            state.endpoints.insert(record.guid(), Arc::new(record));

            let mut next_owner = (*owner).clone();
            next_owner.endpoints.insert(persisted.guid());
            state.participants.insert(owner.id(), Arc::new(next_owner));
            report.endpoints += 1;
        }

        report
    }

    /// Endpoints violating the owner invariant. Always empty unless the store is corrupt.
    pub fn orphaned_endpoints(&self) -> Vec<Guid> {
        let state = self.inner.read();
        state
            .endpoints
            .values()
            .filter(|e| {
                state
                    .participants
                    .get(&e.owner)
                    .map_or(true, |owner| !owner.is_alive() || !owner.endpoints.contains(&e.guid()))
            })
            .map(|e| e.guid())
            .collect()
    }

    /// Get participant count (any status).
    pub fn participant_count(&self) -> usize {
        self.inner.read().participants.len()
    }

    /// Get endpoint count.
    pub fn endpoint_count(&self) -> usize {
        self.inner.read().endpoints.len()
    }
}

impl Default for ProxyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A record yielded by [`StoreSnapshot::iter`].
#[derive(Debug, Clone, Copy)]
pub enum ProxyRef<'a> {
    Participant(&'a Arc<ParticipantRecord>),
    Endpoint(&'a Arc<EndpointRecord>),
}

/// Point-in-time copy of the store. Iterating it is lazy, finite and restartable.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    participants: Vec<Arc<ParticipantRecord>>,
    endpoints: Vec<Arc<EndpointRecord>>,
}

impl StoreSnapshot {
    pub fn participants(&self) -> impl Iterator<Item = &Arc<ParticipantRecord>> + '_ {
        self.participants.iter()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<EndpointRecord>> + '_ {
        self.endpoints.iter()
    }

    /// Participants first, then endpoints, both in identity order.
    pub fn iter(&self) -> impl Iterator<Item = ProxyRef<'_>> + '_ {
        self.participants
            .iter()
            .map(ProxyRef::Participant)
            .chain(self.endpoints.iter().map(ProxyRef::Endpoint))
    }

    pub fn len(&self) -> usize {
        self.participants.len() + self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy suitable for persistence.
    pub fn to_persisted(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            participants: self.participants.iter().map(|p| (**p).clone()).collect(),
            endpoints: self.endpoints.iter().map(|e| (**e).clone()).collect(),
        }
    }
}
