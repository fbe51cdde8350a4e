// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery controller: the server-mode implementation of the discovery
//! protocol.
//!
//! Applies inbound discovery changes to the [`ProxyStore`], records the
//! resulting facts in the [`VisibilityMatrix`], forwards every durable change
//! to the persistence worker and wakes the sync scheduler.
//!
//! # Participant lifecycle
//!
//! ```text
//! UNKNOWN --DATA(p)--> ALIVE --fresher DATA(p)--> ALIVE
//!                        |
//!                        +--lease expiry--> DROPPED --+
//!                        |                            +--trim--> (deleted)
//!                        +--disposal------> REMOVED --+
//! ```
//!
//! A disposal records a disposal fact. A lease expiry does not (the
//! participant never said goodbye); its outstanding facts turn stale instead.

use crate::driver::DiscoveryProtocol;
use crate::error::EngineError;
use crate::host::{Announcer, EndpointHost};
use crate::message::OutboundMessage;
use crate::persistence::{DiscoveryPersistence, PersistedFact, PersistenceWorker};
use crate::scheduler::{self, Awakener, SyncReport, SyncTask};
use crate::store::{ProxyStore, Rejection, Retirement, Upsert};
use crate::types::{
    prefix_to_hex, EndpointData, EndpointRecord, Guid, GuidPrefix, ParticipantData,
    ParticipantRecord, ParticipantRole, ParticipantStatus, RemovalReason,
};
use crate::visibility::{Fact, FactId, Subject, VisibilityMatrix};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Engine tuning parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Cadence of the local liveliness re-send.
    pub announcement_period: Duration,
    /// Sync scheduler tick period.
    pub sync_period: Duration,
    /// How long a retired record must stay stable before it may be trimmed.
    pub trim_grace: Duration,
    /// `awaken()` is a no-op when the next tick is closer than this.
    pub wakeup_imminence: Duration,
    pub max_participants: usize,
    pub max_endpoints_per_participant: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            announcement_period: Duration::from_millis(3000),
            sync_period: Duration::from_millis(450),
            trim_grace: Duration::from_millis(2000),
            wakeup_imminence: Duration::from_millis(10),
            max_participants: 1000,
            max_endpoints_per_participant: 10000,
        }
    }
}

/// Server-mode discovery controller.
pub struct DiscoveryController {
    settings: EngineSettings,
    store: Arc<ProxyStore>,
    matrix: Arc<VisibilityMatrix>,
    host: Arc<dyn EndpointHost>,
    announcer: Arc<dyn Announcer>,
    backend: Arc<dyn DiscoveryPersistence>,
    /// `None` inside means the worker could not be started.
    persistence: OnceLock<Option<PersistenceWorker>>,
    local: OnceLock<GuidPrefix>,
    local_sequence: AtomicU64,
    /// Participants whose builtin endpoints are currently assigned.
    assigned: Mutex<HashSet<GuidPrefix>>,
    /// Last sequence reported upwards per participant.
    notified: Mutex<HashMap<GuidPrefix, u64>>,
    last_announce: Mutex<Instant>,
    awakener: Awakener,
}

impl DiscoveryController {
    pub fn new(
        settings: EngineSettings,
        host: Arc<dyn EndpointHost>,
        announcer: Arc<dyn Announcer>,
        backend: Arc<dyn DiscoveryPersistence>,
    ) -> Self {
        let store = ProxyStore::with_limits(
            settings.max_participants,
            settings.max_endpoints_per_participant,
        );
        let awakener = Awakener::new(settings.wakeup_imminence);
        Self {
            settings,
            store: Arc::new(store),
            matrix: Arc::new(VisibilityMatrix::new()),
            host,
            announcer,
            backend,
            persistence: OnceLock::new(),
            local: OnceLock::new(),
            local_sequence: AtomicU64::new(0),
            assigned: Mutex::new(HashSet::new()),
            notified: Mutex::new(HashMap::new()),
            last_announce: Mutex::new(Instant::now()),
            awakener,
        }
    }

    /// Stand up the engine for the local server participant.
    ///
    /// Restores persisted state, creates the discovery endpoints through the
    /// host and records the first local announcement.
    pub fn init(&self, local: ParticipantData) -> Result<(), EngineError> {
        local
            .validate()
            .map_err(|e| EngineError::InitFailure(e.to_string()))?;
        if local.role != ParticipantRole::Server {
            return Err(EngineError::InitFailure(format!(
                "local participant must be a server, got {:?}",
                local.role
            )));
        }
        let prefix = local.guid_prefix;
        if self.local.set(prefix).is_err() {
            return Err(EngineError::AlreadyInitialized);
        }

        let worker = match PersistenceWorker::spawn(Arc::clone(&self.backend)) {
            Ok(worker) => Some(worker),
            Err(e) => {
                warn!("Persistence worker unavailable, running in-memory: {}", e);
                None
            }
        };
        let snapshot = match self.backend.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let failure = EngineError::PersistenceFailure(format!("{:#}", e));
                warn!("{}", failure);
                if let Some(worker) = &worker {
                    worker.mark_degraded(&failure.to_string());
                }
                None
            }
        };
        let _ = self.persistence.set(worker);

        let mut sequence = 1;
        if let Some(snapshot) = &snapshot {
            if let Some(previous) = snapshot.participants.iter().find(|p| p.id() == prefix) {
                sequence = previous.sequence + 1;
            }
            let report = self.store.restore(snapshot, &prefix);
            info!(
                "Restored {} participants and {} endpoints ({} orphans dropped)",
                report.participants, report.endpoints, report.orphans
            );
        }
        self.local_sequence.store(sequence, Ordering::SeqCst);
        let record = self.store.insert_local(local, sequence);

        self.create_discovery_endpoints()?;
        self.rebuild_restored_facts();

        self.matrix
            .record_fact(Fact::announce(Subject::Participant(prefix), sequence));
        self.persist(PersistedFact::Participant((*record).clone()));
        *self.last_announce.lock() = Instant::now();

        info!(
            "Discovery engine initialized for {} (sequence {})",
            prefix_to_hex(&prefix),
            sequence
        );
        Ok(())
    }

    /// Create the local builtin discovery endpoints through the host.
    pub fn create_discovery_endpoints(&self) -> Result<(), EngineError> {
        let local = self.local.get().ok_or(EngineError::NotInitialized)?;
        let record = self
            .store
            .participant(local)
            .ok_or(EngineError::NotInitialized)?;
        self.host
            .create_discovery_endpoints(&record)
            .map_err(|e| EngineError::InitFailure(e.to_string()))
    }

    /// Give restored records facts so every peer learns them again.
    ///
    /// Peers are registered first so each fact starts `PENDING` for all of
    /// them. A retired record keeps blocking its trim until the peers settle
    /// it: a removed one through its disposal, a dropped one through the
    /// stale entries of its last announcement.
    fn rebuild_restored_facts(&self) {
        let snapshot = self.store.snapshot();
        let remote = || snapshot.participants().filter(|p| !p.is_local());

        for participant in remote().filter(|p| p.is_alive() && p.data.role.is_peer()) {
            self.matrix.add_peer(participant.id());
        }
        for participant in remote() {
            let subject = Subject::Participant(participant.id());
            match participant.status {
                ParticipantStatus::Alive => {
                    self.matrix
                        .record_fact(Fact::announce(subject, participant.sequence));
                }
                ParticipantStatus::Removed => {
                    self.matrix
                        .record_fact(Fact::dispose(subject, participant.sequence));
                }
                ParticipantStatus::Dropped => {
                    self.matrix
                        .record_fact(Fact::announce(subject, participant.sequence));
                    self.matrix.mark_stale(&participant.id());
                }
            }
        }
        for endpoint in snapshot.endpoints() {
            self.matrix
                .record_fact(Fact::announce(Subject::Endpoint(endpoint.guid()), endpoint.sequence));
        }
        for participant in remote().filter(|p| p.is_alive() && p.data.role.is_peer()) {
            self.assign_remote_endpoints(participant);
        }
    }

    /// Apply a DATA(p).
    ///
    /// Returns the current record, or `None` when the descriptor was
    /// malformed or not admitted.
    pub fn create_or_update_participant_proxy(
        &self,
        data: ParticipantData,
        sequence: u64,
        writer: Guid,
    ) -> Option<Arc<ParticipantRecord>> {
        if self.local.get().is_none() {
            warn!("DATA(p) before init: {}", EngineError::NotInitialized);
            return None;
        }
        if let Err(e) = data.validate() {
            warn!("Rejected participant descriptor: {}", e);
            return None;
        }

        let id = data.guid_prefix;
        match self.store.upsert_participant(data, sequence, writer) {
            Upsert::Applied { record, created } => {
                self.matrix
                    .record_fact(Fact::announce(Subject::Participant(id), record.sequence));
                if created {
                    info!(
                        "Discovered participant {} ({:?})",
                        prefix_to_hex(&id),
                        record.data.role
                    );
                }
                if record.data.role.is_peer() {
                    if self.matrix.add_peer(id) {
                        info!("Peer {} joined", prefix_to_hex(&id));
                    }
                    self.assign_remote_endpoints(&record);
                }
                self.notify_above_remote_endpoints(&record);
                self.persist(PersistedFact::Participant((*record).clone()));
                self.awaken();
                Some(record)
            }
            Upsert::Rejected { reason, current } => match reason {
                Rejection::Duplicate => {
                    debug!("Duplicate DATA(p) seq {} from {}", sequence, prefix_to_hex(&id));
                    current
                }
                Rejection::Stale => {
                    debug!(
                        "{}",
                        EngineError::StaleUpdate(format!("{} seq {}", prefix_to_hex(&id), sequence))
                    );
                    current
                }
                Rejection::Protected => {
                    debug!("Ignoring DATA(p) describing the local participant");
                    None
                }
                Rejection::CapacityExceeded => {
                    warn!(
                        "Max participants reached, rejecting {}",
                        prefix_to_hex(&id)
                    );
                    None
                }
                Rejection::UnknownOwner => None,
            },
        }
    }

    /// Remove a remote participant without a sequence check.
    pub fn remove_remote_participant(&self, id: &GuidPrefix, reason: RemovalReason) -> bool {
        self.retire(id, reason, None)
    }

    /// Apply a participant disposal message.
    pub fn dispose_participant_proxy(&self, id: &GuidPrefix, sequence: u64) -> bool {
        self.retire(id, RemovalReason::Disposed, Some(sequence))
    }

    fn retire(&self, id: &GuidPrefix, reason: RemovalReason, sequence: Option<u64>) -> bool {
        match self.store.retire_participant(id, reason, sequence) {
            Retirement::Retired { record, endpoints } => {
                self.remove_remote_endpoints(&record);
                self.host.participant_removed(&record, reason);
                self.notified.lock().remove(id);

                match reason {
                    RemovalReason::Disposed => {
                        self.matrix
                            .record_fact(Fact::dispose(Subject::Participant(*id), record.sequence));
                    }
                    RemovalReason::Dropped => self.matrix.mark_stale(id),
                }
                if record.data.role.is_peer() {
                    let released = self.matrix.drop_peer(id);
                    info!(
                        "Peer {} left, {} facts released",
                        prefix_to_hex(id),
                        released.len()
                    );
                }

                info!(
                    "Participant {} {:?} ({} endpoints removed)",
                    prefix_to_hex(id),
                    record.status,
                    endpoints.len()
                );
                self.persist(PersistedFact::Participant((*record).clone()));
                self.awaken();
                true
            }
            Retirement::Rejected(rejection) => {
                debug!(
                    "Removal of {} ({:?}) rejected: {:?}",
                    prefix_to_hex(id),
                    reason,
                    rejection
                );
                false
            }
            Retirement::NotFound => {
                debug!("Removal of unknown participant {}", prefix_to_hex(id));
                false
            }
        }
    }

    /// Apply a DATA(w) / DATA(r).
    pub fn create_or_update_endpoint_proxy(
        &self,
        data: EndpointData,
        sequence: u64,
    ) -> Option<Arc<EndpointRecord>> {
        if let Err(e) = data.validate() {
            warn!("Rejected endpoint descriptor: {}", e);
            return None;
        }

        let guid = data.guid;
        let owner = guid.prefix;
        match self.store.upsert_endpoint(&owner, data, sequence) {
            Upsert::Applied { record, .. } => {
                self.matrix
                    .record_fact(Fact::announce(Subject::Endpoint(guid), record.sequence));
                let is_assigned = self.assigned.lock().contains(&owner);
                let record = if is_assigned && !record.matched {
                    self.store.set_endpoints_matched(&owner, true);
                    self.store.endpoint(&guid).unwrap_or(record)
                } else {
                    record
                };
                debug!("Endpoint {} on '{}' seq {}", guid, record.data.topic_name, sequence);
                self.persist(PersistedFact::Endpoint((*record).clone()));
                self.awaken();
                Some(record)
            }
            Upsert::Rejected { reason, current } => match reason {
                Rejection::UnknownOwner => {
                    warn!("{}", EngineError::UnknownOwner(format!("{} for endpoint {}", prefix_to_hex(&owner), guid)));
                    None
                }
                Rejection::Stale | Rejection::Duplicate => {
                    debug!("{}", EngineError::StaleUpdate(format!("{} seq {}", guid, sequence)));
                    current
                }
                Rejection::CapacityExceeded => {
                    warn!(
                        "Max endpoints reached for {}, rejecting {}",
                        prefix_to_hex(&owner),
                        guid
                    );
                    None
                }
                Rejection::Protected => None,
            },
        }
    }

    /// Apply an endpoint disposal. With a sequence, only if newer than the applied one.
    pub fn remove_endpoint_proxy(&self, guid: &Guid, sequence: Option<u64>) -> bool {
        let Some(removed) = self.store.retire_endpoint(guid, sequence) else {
            debug!("Endpoint disposal for {} ignored", guid);
            return false;
        };
        let sequence = sequence.unwrap_or(removed.sequence);
        self.matrix
            .record_fact(Fact::dispose(Subject::Endpoint(*guid), sequence));
        self.persist(PersistedFact::EndpointRemoved(*guid));
        self.awaken();
        true
    }

    /// Record acks from `peer`. Returns how many were accepted.
    pub fn acknowledge(&self, peer: &GuidPrefix, changes: &[FactId]) -> usize {
        let accepted = changes
            .iter()
            .filter(|id| self.matrix.ack(**id, peer))
            .count();
        if accepted > 0 {
            self.store.touch(peer);
        }
        accepted
    }

    /// Refresh the lease of a participant.
    pub fn assert_liveliness(&self, id: &GuidPrefix) -> bool {
        self.store.touch(id)
    }

    /// Match the builtin endpoints of `participant`. Idempotent.
    pub fn assign_remote_endpoints(&self, participant: &ParticipantRecord) -> bool {
        if participant.is_local() || !participant.is_alive() {
            return false;
        }
        let id = participant.id();
        if !self.assigned.lock().insert(id) {
            return false;
        }
        self.host.assign_remote_endpoints(participant);
        self.store.set_endpoints_matched(&id, true);
        true
    }

    /// Unmatch the builtin endpoints of `participant`. Idempotent.
    pub fn remove_remote_endpoints(&self, participant: &ParticipantRecord) -> bool {
        let id = participant.id();
        if !self.assigned.lock().remove(&id) {
            return false;
        }
        self.host.remove_remote_endpoints(participant);
        self.store.set_endpoints_matched(&id, false);
        true
    }

    /// Report `participant` upwards once per sequence number.
    pub fn notify_above_remote_endpoints(&self, participant: &ParticipantRecord) -> bool {
        if participant.is_local() || !participant.is_alive() {
            return false;
        }
        {
            let mut notified = self.notified.lock();
            let last = notified.entry(participant.id()).or_insert(0);
            if *last >= participant.sequence {
                return false;
            }
            *last = participant.sequence;
        }
        self.host.notify_above_remote_endpoints(participant);
        true
    }

    /// Publish the local participant state.
    ///
    /// `force_new_change` records a new change with a fresh sequence number;
    /// otherwise the current change is re-sent to every peer as a liveliness
    /// assertion. `dispose` sends a disposal to every peer right away.
    pub fn announce_participant_state(&self, force_new_change: bool, dispose: bool) {
        let Some(local) = self.local.get() else {
            return;
        };
        let Some(record) = self.store.participant(local) else {
            return;
        };

        if dispose {
            let sequence = self.local_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let peers = self.matrix.peers();
            let reached = peers
                .iter()
                .filter(|peer| {
                    self.announcer.send(
                        peer,
                        OutboundMessage::ParticipantDisposed {
                            change: None,
                            guid_prefix: *local,
                            sequence,
                        },
                    )
                })
                .count();
            // Persist the sequence so a restart announces past the disposal
            let mut persisted = (*record).clone();
            persisted.sequence = sequence;
            self.persist(PersistedFact::Participant(persisted));
            info!(
                "Local disposal announced to {}/{} peers",
                reached,
                peers.len()
            );
        } else if force_new_change {
            let sequence = self.local_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let record = self.store.insert_local(record.data.clone(), sequence);
            self.matrix
                .record_fact(Fact::announce(Subject::Participant(*local), sequence));
            self.persist(PersistedFact::Participant((*record).clone()));
            debug!("Local participant announced as new change {}", sequence);
            self.awaken();
        } else if let Some(message) = self.local_announcement() {
            for peer in self.matrix.peers() {
                self.announcer.send(&peer, message.clone());
            }
        }
        *self.last_announce.lock() = Instant::now();
    }

    /// Current local DATA(p) as an outbound message.
    pub fn local_announcement(&self) -> Option<OutboundMessage> {
        let local = self.local.get()?;
        let record = self.store.participant(local)?;
        Some(OutboundMessage::Participant {
            change: self.matrix.latest(&Subject::Participant(*local)),
            data: record.data.clone(),
            sequence: record.sequence,
            writer: record.writer,
        })
    }

    /// One sync pass: lease expiry, local liveliness, re-announcement, trimming.
    pub fn sync(&self, now: Instant) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(local) = self.local.get().copied() else {
            return report;
        };

        for id in self.store.expired(now) {
            if self.retire(&id, RemovalReason::Dropped, None) {
                info!("Participant {} lease expired", prefix_to_hex(&id));
                report.expired += 1;
            }
        }

        let announce_due = {
            let last = self.last_announce.lock();
            now.saturating_duration_since(*last) >= self.settings.announcement_period
        };
        // Stale entries only resolve once the peer acks something newer
        let local_settled = self
            .matrix
            .latest(&Subject::Participant(local))
            .map_or(true, |id| self.matrix.is_trimmable(id));
        if self.matrix.has_stale_blockers() && local_settled {
            self.announce_participant_state(true, false);
        } else if announce_due {
            self.announce_participant_state(false, false);
        }

        report.announced =
            scheduler::reannounce(&self.store, &self.matrix, self.announcer.as_ref());

        for record in scheduler::trim(&self.store, &self.matrix, self.settings.trim_grace, now) {
            let id = record.id();
            self.assigned.lock().remove(&id);
            self.notified.lock().remove(&id);
            self.persist(PersistedFact::ParticipantPurged(id));
            info!("Trimmed participant {} ({:?})", prefix_to_hex(&id), record.status);
            report.trimmed += 1;
        }

        report.compacted = self.matrix.compact() + self.matrix.release_endpoint_disposals();
        report
    }

    fn persist(&self, fact: PersistedFact) {
        if let Some(Some(worker)) = self.persistence.get() {
            worker.submit(fact);
        }
    }

    /// Request an early sync tick.
    pub fn awaken(&self) -> bool {
        self.awakener.awaken()
    }

    pub fn awakener(&self) -> Awakener {
        self.awakener.clone()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ProxyStore> {
        &self.store
    }

    pub fn matrix(&self) -> &Arc<VisibilityMatrix> {
        &self.matrix
    }

    pub fn local_prefix(&self) -> Option<GuidPrefix> {
        self.local.get().copied()
    }

    /// True when durable writes are no longer performed this run.
    pub fn is_persistence_degraded(&self) -> bool {
        match self.persistence.get() {
            Some(Some(worker)) => worker.is_degraded(),
            Some(None) => true,
            None => false,
        }
    }

    /// Wait for queued durable writes.
    pub async fn flush_persistence(&self) {
        if let Some(Some(worker)) = self.persistence.get() {
            worker.flush().await;
        }
    }

    /// Flush and stop the persistence worker.
    pub async fn close(&self) {
        if let Some(Some(worker)) = self.persistence.get() {
            worker.flush().await;
            worker.stop();
        }
    }
}

impl SyncTask for DiscoveryController {
    fn run_sync(&self, now: Instant) -> SyncReport {
        self.sync(now)
    }
}

impl DiscoveryProtocol for DiscoveryController {
    fn init(&self, local: ParticipantData) -> Result<(), EngineError> {
        DiscoveryController::init(self, local)
    }

    fn create_or_update_participant_proxy(
        &self,
        data: ParticipantData,
        sequence: u64,
        writer: Guid,
    ) -> Option<Arc<ParticipantRecord>> {
        DiscoveryController::create_or_update_participant_proxy(self, data, sequence, writer)
    }

    fn remove_remote_participant(&self, id: &GuidPrefix, reason: RemovalReason) -> bool {
        DiscoveryController::remove_remote_participant(self, id, reason)
    }

    fn announce_participant_state(&self, force_new_change: bool, dispose: bool) {
        DiscoveryController::announce_participant_state(self, force_new_change, dispose)
    }

    fn dispose_participant_proxy(&self, id: &GuidPrefix, sequence: u64) -> bool {
        DiscoveryController::dispose_participant_proxy(self, id, sequence)
    }

    fn create_or_update_endpoint_proxy(
        &self,
        data: EndpointData,
        sequence: u64,
    ) -> Option<Arc<EndpointRecord>> {
        DiscoveryController::create_or_update_endpoint_proxy(self, data, sequence)
    }

    fn remove_endpoint_proxy(&self, guid: &Guid, sequence: Option<u64>) -> bool {
        DiscoveryController::remove_endpoint_proxy(self, guid, sequence)
    }

    fn acknowledge(&self, peer: &GuidPrefix, changes: &[FactId]) -> usize {
        DiscoveryController::acknowledge(self, peer, changes)
    }

    fn assert_liveliness(&self, id: &GuidPrefix) -> bool {
        DiscoveryController::assert_liveliness(self, id)
    }
}
