// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Visibility matrix: which discovery facts each peer has acknowledged.
//!
//! A *fact* is one discovery change (participant or endpoint announce or
//! dispose). For every fact the matrix keeps one entry per known peer:
//!
//! ```text
//!            peer A    peer B    peer C
//! fact 12    ACKED     PENDING   ACKED
//! fact 13    STALE     ACKED     PENDING
//! ```
//!
//! Only the latest fact of a subject is (re)announced. Older facts of the
//! same subject stay tracked: their pending entries turn `STALE` and resolve
//! once the peer acknowledges a newer fact of that subject, or once the
//! peer's ack clock (highest fact id it acknowledged) has moved past them.
//!
//! A fact is trimmable when no known peer still has it `PENDING` or an
//! unresolved `STALE`. Dropping a peer removes its entries.

use crate::types::{prefix_to_hex, Guid, GuidPrefix};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Fact identifier, increasing in recording order.
pub type FactId = u64;

/// Peer identifier (a remote server or registered client).
pub type PeerId = GuidPrefix;

/// Entity a fact is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    Participant(GuidPrefix),
    Endpoint(Guid),
}

impl Subject {
    /// Participant owning the subject.
    pub fn participant(&self) -> GuidPrefix {
        match self {
            Self::Participant(prefix) => *prefix,
            Self::Endpoint(guid) => guid.prefix,
        }
    }
}

/// Kind of discovery change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactKind {
    Announce,
    Dispose,
}

/// A discrete discovery change tracked for acknowledgment and trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fact {
    pub subject: Subject,
    pub kind: FactKind,
    /// Sequence number of the change on the subject's writer.
    pub sequence: u64,
}

impl Fact {
    /// Ordering of changes on one subject: by sequence, a disposal after an
    /// announcement carrying the same sequence.
    fn order(&self) -> (u64, bool) {
        (self.sequence, self.kind == FactKind::Dispose)
    }

    pub fn announce(subject: Subject, sequence: u64) -> Self {
        Self {
            subject,
            kind: FactKind::Announce,
            sequence,
        }
    }

    pub fn dispose(subject: Subject, sequence: u64) -> Self {
        Self {
            subject,
            kind: FactKind::Dispose,
            sequence,
        }
    }
}

/// Acknowledgment state of one (fact, peer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    /// Superseded before the peer acknowledged it.
    Stale,
}

#[derive(Debug)]
struct FactEntry {
    fact: Fact,
    superseded: bool,
    acks: HashMap<PeerId, AckState>,
}

impl FactEntry {
    fn settled_for(&self, peer: &PeerId, id: FactId, clocks: &HashMap<PeerId, FactId>) -> bool {
        match self.acks.get(peer) {
            None | Some(AckState::Acked) => true,
            Some(AckState::Stale) => clocks.get(peer).is_some_and(|clock| *clock > id),
            Some(AckState::Pending) => false,
        }
    }

    fn settled(&self, id: FactId, clocks: &HashMap<PeerId, FactId>) -> bool {
        self.acks
            .keys()
            .all(|peer| self.settled_for(peer, id, clocks))
    }

    fn mark_stale(&mut self) {
        for state in self.acks.values_mut() {
            if *state == AckState::Pending {
                *state = AckState::Stale;
            }
        }
    }
}

#[derive(Debug)]
struct MatrixState {
    next_id: FactId,
    facts: BTreeMap<FactId, FactEntry>,
    latest: HashMap<Subject, FactId>,
    peers: BTreeSet<PeerId>,
    clocks: HashMap<PeerId, FactId>,
    /// Participants whose outstanding facts are no longer announced.
    retired: HashSet<GuidPrefix>,
}

impl Default for MatrixState {
    fn default() -> Self {
        Self {
            next_id: 1,
            facts: BTreeMap::new(),
            latest: HashMap::new(),
            peers: BTreeSet::new(),
            clocks: HashMap::new(),
            retired: HashSet::new(),
        }
    }
}

impl MatrixState {
    fn stale_participant_facts(&mut self, participant: &GuidPrefix) {
        for entry in self.facts.values_mut() {
            if entry.fact.subject.participant() == *participant {
                entry.mark_stale();
            }
        }
    }
}

/// Per-peer acknowledgment bookkeeping.
#[derive(Debug, Default)]
pub struct VisibilityMatrix {
    inner: Mutex<MatrixState>,
}

impl VisibilityMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new fact. Every known peer starts `PENDING`, except the peer
    /// the fact is about, which trivially knows it.
    ///
    /// A fact not newer than the subject's latest one is not recorded; the
    /// latest id is returned instead. A subject never moves backwards.
    pub fn record_fact(&self, fact: Fact) -> FactId {
        let mut state = self.inner.lock();
        if let Some(latest) = state.latest.get(&fact.subject).copied() {
            if let Some(entry) = state.facts.get(&latest) {
                if entry.fact.order() >= fact.order() {
                    debug!(
                        "Visibility: {:?} seq {} not newer than fact {}, ignored",
                        fact.kind, fact.sequence, latest
                    );
                    return latest;
                }
            }
        }
        let id = state.next_id;
        state.next_id += 1;

        let owner = fact.subject.participant();
        match (fact.subject, fact.kind) {
            (Subject::Participant(_), FactKind::Dispose) => {
                state.stale_participant_facts(&owner);
                state.retired.insert(owner);
            }
            (Subject::Participant(_), FactKind::Announce) => {
                state.retired.remove(&owner);
            }
            _ => {}
        }

        if let Some(previous) = state.latest.insert(fact.subject, id) {
            if let Some(entry) = state.facts.get_mut(&previous) {
                entry.superseded = true;
                entry.mark_stale();
            }
        }

        let acks = state
            .peers
            .iter()
            .map(|peer| {
                let ack = if *peer == owner {
                    AckState::Acked
                } else {
                    AckState::Pending
                };
                (*peer, ack)
            })
            .collect();
        state.facts.insert(
            id,
            FactEntry {
                fact,
                superseded: false,
                acks,
            },
        );
        id
    }

    /// Record that `peer` acknowledged `id`.
    ///
    /// Acks are cumulative: older facts of the same subject are acknowledged
    /// too, and a participant disposal covers every older fact about that
    /// participant's endpoints. Applying the same ack twice, or acks in any
    /// order, yields the same state.
    pub fn ack(&self, id: FactId, peer: &PeerId) -> bool {
        let mut state = self.inner.lock();
        if !state.peers.contains(peer) {
            return false;
        }
        let Some(entry) = state.facts.get(&id) else {
            return false;
        };
        let subject = entry.fact.subject;
        let disposed_participant = match (subject, entry.fact.kind) {
            (Subject::Participant(prefix), FactKind::Dispose) => Some(prefix),
            _ => None,
        };

        for (_, entry) in state.facts.range_mut(..=id) {
            let covered = entry.fact.subject == subject
                || disposed_participant.is_some_and(|p| entry.fact.subject.participant() == p);
            if covered {
                if let Some(ack) = entry.acks.get_mut(peer) {
                    *ack = AckState::Acked;
                }
            }
        }

        let clock = state.clocks.entry(*peer).or_insert(0);
        *clock = (*clock).max(id);
        true
    }

    /// Latest facts not yet acknowledged by `peer`, oldest first.
    pub fn pending_for(&self, peer: &PeerId) -> Vec<FactId> {
        let state = self.inner.lock();
        state
            .facts
            .iter()
            .filter(|(_, entry)| {
                !entry.superseded && entry.acks.get(peer) == Some(&AckState::Pending)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// True once every known peer acknowledged `id` (or no longer needs it).
    /// Unknown ids are trimmable.
    pub fn is_trimmable(&self, id: FactId) -> bool {
        let state = self.inner.lock();
        state
            .facts
            .get(&id)
            .map_or(true, |entry| entry.settled(id, &state.clocks))
    }

    /// True once every fact about `participant` and its endpoints is trimmable.
    pub fn participant_settled(&self, participant: &GuidPrefix) -> bool {
        let state = self.inner.lock();
        state
            .facts
            .iter()
            .filter(|(_, entry)| entry.fact.subject.participant() == *participant)
            .all(|(id, entry)| entry.settled(*id, &state.clocks))
    }

    /// Register a peer. Every live latest announcement becomes `PENDING` for it.
    pub fn add_peer(&self, peer: PeerId) -> bool {
        let mut state = self.inner.lock();
        if !state.peers.insert(peer) {
            return false;
        }
        let MatrixState { facts, retired, .. } = &mut *state;
        for entry in facts.values_mut() {
            let owner = entry.fact.subject.participant();
            if entry.superseded || entry.fact.kind != FactKind::Announce || retired.contains(&owner)
            {
                continue;
            }
            let ack = if owner == peer {
                AckState::Acked
            } else {
                AckState::Pending
            };
            entry.acks.insert(peer, ack);
        }
        debug!("Visibility: peer {} added", prefix_to_hex(&peer));
        true
    }

    /// Forget a peer. Returns the facts it alone was keeping from trimming.
    pub fn drop_peer(&self, peer: &PeerId) -> Vec<FactId> {
        let mut state = self.inner.lock();
        if !state.peers.remove(peer) {
            return Vec::new();
        }
        let MatrixState { facts, clocks, .. } = &mut *state;
        let mut released = Vec::new();
        for (id, entry) in facts.iter_mut() {
            let blocked = !entry.settled(*id, clocks);
            entry.acks.remove(peer);
            if blocked && entry.settled(*id, clocks) {
                released.push(*id);
            }
        }
        clocks.remove(peer);
        debug!(
            "Visibility: peer {} dropped, {} facts released",
            prefix_to_hex(peer),
            released.len()
        );
        released
    }

    /// Stop announcing a participant that went away without a disposal.
    /// Its pending entries turn `STALE`.
    pub fn mark_stale(&self, participant: &GuidPrefix) {
        let mut state = self.inner.lock();
        state.stale_participant_facts(participant);
        state.retired.insert(*participant);
    }

    /// Remove every fact about a trimmed participant.
    pub fn forget_participant(&self, participant: &GuidPrefix) -> usize {
        let mut state = self.inner.lock();
        let before = state.facts.len();
        state
            .facts
            .retain(|_, entry| entry.fact.subject.participant() != *participant);
        state
            .latest
            .retain(|subject, _| subject.participant() != *participant);
        state.retired.remove(participant);
        before - state.facts.len()
    }

    /// Discard superseded facts nobody is waiting on.
    pub fn compact(&self) -> usize {
        let mut state = self.inner.lock();
        let MatrixState { facts, clocks, .. } = &mut *state;
        let before = facts.len();
        facts.retain(|id, entry| !(entry.superseded && entry.settled(*id, clocks)));
        before - facts.len()
    }

    /// Discard endpoint disposals every peer has acknowledged.
    pub fn release_endpoint_disposals(&self) -> usize {
        let mut state = self.inner.lock();
        let settled: Vec<Subject> = state
            .latest
            .iter()
            .filter(|(subject, _)| matches!(subject, Subject::Endpoint(_)))
            .filter(|(_, id)| {
                state.facts.get(*id).is_some_and(|entry| {
                    entry.fact.kind == FactKind::Dispose && entry.settled(**id, &state.clocks)
                })
            })
            .filter(|(subject, _)| {
                state
                    .facts
                    .iter()
                    .filter(|(_, entry)| entry.fact.subject == **subject)
                    .all(|(id, entry)| entry.settled(*id, &state.clocks))
            })
            .map(|(subject, _)| *subject)
            .collect();

        for subject in &settled {
            state.latest.remove(subject);
            state.facts.retain(|_, entry| entry.fact.subject != *subject);
        }
        settled.len()
    }

    /// True if some `STALE` entry is waiting on a peer's ack clock.
    pub fn has_stale_blockers(&self) -> bool {
        let state = self.inner.lock();
        state.facts.iter().any(|(id, entry)| {
            entry.acks.iter().any(|(peer, ack)| {
                *ack == AckState::Stale && !entry.settled_for(peer, *id, &state.clocks)
            })
        })
    }

    pub fn fact(&self, id: FactId) -> Option<Fact> {
        self.inner.lock().facts.get(&id).map(|entry| entry.fact)
    }

    /// Latest fact recorded for a subject.
    pub fn latest(&self, subject: &Subject) -> Option<FactId> {
        self.inner.lock().latest.get(subject).copied()
    }

    pub fn ack_state(&self, id: FactId, peer: &PeerId) -> Option<AckState> {
        self.inner
            .lock()
            .facts
            .get(&id)
            .and_then(|entry| entry.acks.get(peer).copied())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.lock().peers.iter().copied().collect()
    }

    pub fn is_peer(&self, peer: &PeerId) -> bool {
        self.inner.lock().peers.contains(peer)
    }

    pub fn fact_count(&self) -> usize {
        self.inner.lock().facts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gp(id: u8) -> GuidPrefix {
        let mut prefix = [0u8; 12];
        prefix[0] = id;
        prefix
    }

    fn matrix_with_peers(peers: &[u8]) -> VisibilityMatrix {
        let matrix = VisibilityMatrix::new();
        for peer in peers {
            matrix.add_peer(gp(*peer));
        }
        matrix
    }

    #[test]
    fn test_record_fact_pending_for_every_peer() {
        let matrix = matrix_with_peers(&[2, 3]);
        let id = matrix.record_fact(Fact::announce(Subject::Participant(gp(1)), 1));

        assert_eq!(matrix.pending_for(&gp(2)), vec![id]);
        assert_eq!(matrix.pending_for(&gp(3)), vec![id]);
        assert!(!matrix.is_trimmable(id));
    }

    #[test]
    fn test_subject_peer_is_implicitly_acked() {
        let matrix = matrix_with_peers(&[1, 2]);
        let id = matrix.record_fact(Fact::announce(Subject::Participant(gp(1)), 1));

        assert_eq!(matrix.ack_state(id, &gp(1)), Some(AckState::Acked));
        assert!(matrix.pending_for(&gp(1)).is_empty());
    }

    #[test]
    fn test_trimmable_only_after_all_acks() {
        let matrix = matrix_with_peers(&[2, 3]);
        let id = matrix.record_fact(Fact::dispose(Subject::Participant(gp(1)), 6));

        assert!(matrix.ack(id, &gp(2)));
        assert!(!matrix.is_trimmable(id));

        assert!(matrix.ack(id, &gp(3)));
        assert!(matrix.is_trimmable(id));
    }

    #[test]
    fn test_ack_is_idempotent_and_commutative() {
        let a = matrix_with_peers(&[2, 3]);
        let b = matrix_with_peers(&[2, 3]);
        let subject = Subject::Participant(gp(1));
        let (a1, a2) = (
            a.record_fact(Fact::announce(subject, 1)),
            a.record_fact(Fact::announce(subject, 2)),
        );
        let (b1, b2) = (
            b.record_fact(Fact::announce(subject, 1)),
            b.record_fact(Fact::announce(subject, 2)),
        );

        a.ack(a1, &gp(2));
        a.ack(a2, &gp(2));
        a.ack(a2, &gp(2));
        b.ack(b2, &gp(2));
        b.ack(b1, &gp(2));

        for (x, y) in [(a1, b1), (a2, b2)] {
            assert_eq!(a.ack_state(x, &gp(2)), b.ack_state(y, &gp(2)));
            assert_eq!(a.ack_state(x, &gp(3)), b.ack_state(y, &gp(3)));
        }
    }

    #[test]
    fn test_ack_from_unknown_peer_ignored() {
        let matrix = matrix_with_peers(&[2]);
        let id = matrix.record_fact(Fact::announce(Subject::Participant(gp(1)), 1));
        assert!(!matrix.ack(id, &gp(9)));
        assert!(!matrix.ack(999, &gp(2)));
    }

    #[test]
    fn test_older_fact_does_not_supersede_newer() {
        let matrix = matrix_with_peers(&[2]);
        let subject = Subject::Participant(gp(1));
        let newer = matrix.record_fact(Fact::announce(subject, 6));

        // A writer that lost the race records its older change last
        assert_eq!(matrix.record_fact(Fact::announce(subject, 5)), newer);
        assert_eq!(matrix.record_fact(Fact::announce(subject, 6)), newer);
        assert_eq!(matrix.latest(&subject), Some(newer));
        assert_eq!(matrix.fact(newer).unwrap().sequence, 6);
        assert_eq!(matrix.pending_for(&gp(2)), vec![newer]);
        assert_eq!(matrix.fact_count(), 1);

        // A disposal carrying the same sequence still moves the subject on
        let dispose = matrix.record_fact(Fact::dispose(subject, 6));
        assert_ne!(dispose, newer);
        assert_eq!(matrix.latest(&subject), Some(dispose));
        assert_eq!(matrix.record_fact(Fact::announce(subject, 6)), dispose);
    }

    #[test]
    fn test_superseded_fact_not_announced_but_tracked() {
        let matrix = matrix_with_peers(&[2, 3]);
        let subject = Subject::Participant(gp(1));
        let old = matrix.record_fact(Fact::announce(subject, 1));
        matrix.ack(old, &gp(2));
        let new = matrix.record_fact(Fact::announce(subject, 2));

        // Only the latest is re-announced
        assert_eq!(matrix.pending_for(&gp(3)), vec![new]);
        assert_eq!(matrix.ack_state(old, &gp(3)), Some(AckState::Stale));
        // The fast peer does not mask the slow one
        assert!(!matrix.is_trimmable(old));

        matrix.ack(new, &gp(3));
        assert!(matrix.is_trimmable(old));
        assert!(!matrix.is_trimmable(new));
    }

    #[test]
    fn test_drop_peer_releases_blocked_facts() {
        let matrix = matrix_with_peers(&[2, 3]);
        let id = matrix.record_fact(Fact::dispose(Subject::Participant(gp(1)), 2));
        matrix.ack(id, &gp(3));

        let released = matrix.drop_peer(&gp(2));
        assert_eq!(released, vec![id]);
        assert!(matrix.is_trimmable(id));
        assert!(matrix.drop_peer(&gp(2)).is_empty());
    }

    #[test]
    fn test_participant_disposal_ack_covers_endpoints() {
        let matrix = matrix_with_peers(&[2]);
        let endpoint = Subject::Endpoint(Guid::new(gp(1), [0, 0, 1, 3]));
        let ep_fact = matrix.record_fact(Fact::announce(endpoint, 1));
        let dispose = matrix.record_fact(Fact::dispose(Subject::Participant(gp(1)), 3));

        assert_eq!(matrix.ack_state(ep_fact, &gp(2)), Some(AckState::Stale));
        assert_eq!(matrix.pending_for(&gp(2)), vec![dispose]);
        assert!(!matrix.participant_settled(&gp(1)));

        matrix.ack(dispose, &gp(2));
        assert!(matrix.participant_settled(&gp(1)));
    }

    #[test]
    fn test_mark_stale_resolves_with_ack_clock() {
        let matrix = matrix_with_peers(&[2]);
        let id = matrix.record_fact(Fact::announce(Subject::Participant(gp(1)), 1));
        matrix.mark_stale(&gp(1));

        assert!(matrix.pending_for(&gp(2)).is_empty());
        assert!(matrix.has_stale_blockers());
        assert!(!matrix.participant_settled(&gp(1)));

        let later = matrix.record_fact(Fact::announce(Subject::Participant(gp(5)), 1));
        matrix.ack(later, &gp(2));
        assert!(!matrix.has_stale_blockers());
        assert!(matrix.participant_settled(&gp(1)));
        assert!(matrix.is_trimmable(id));
    }

    #[test]
    fn test_add_peer_gets_live_latest_only() {
        let matrix = matrix_with_peers(&[2]);
        let subject = Subject::Participant(gp(1));
        let old = matrix.record_fact(Fact::announce(subject, 1));
        let new = matrix.record_fact(Fact::announce(subject, 2));
        let gone = matrix.record_fact(Fact::dispose(Subject::Participant(gp(4)), 9));

        assert!(matrix.add_peer(gp(3)));
        assert!(!matrix.add_peer(gp(3)));
        assert_eq!(matrix.pending_for(&gp(3)), vec![new]);
        assert_eq!(matrix.ack_state(old, &gp(3)), None);
        assert_eq!(matrix.ack_state(gone, &gp(3)), None);
    }

    #[test]
    fn test_compact_and_forget() {
        let matrix = matrix_with_peers(&[2]);
        let subject = Subject::Participant(gp(1));
        matrix.record_fact(Fact::announce(subject, 1));
        let new = matrix.record_fact(Fact::announce(subject, 2));
        assert_eq!(matrix.compact(), 0);

        matrix.ack(new, &gp(2));
        assert_eq!(matrix.compact(), 1);
        assert_eq!(matrix.fact_count(), 1);

        assert_eq!(matrix.forget_participant(&gp(1)), 1);
        assert_eq!(matrix.latest(&subject), None);
        assert_eq!(matrix.fact_count(), 0);
    }

    #[test]
    fn test_release_endpoint_disposals() {
        let matrix = matrix_with_peers(&[2]);
        let endpoint = Subject::Endpoint(Guid::new(gp(1), [0, 0, 1, 3]));
        matrix.record_fact(Fact::announce(endpoint, 1));
        let dispose = matrix.record_fact(Fact::dispose(endpoint, 2));
        assert_eq!(matrix.release_endpoint_disposals(), 0);

        matrix.ack(dispose, &gp(2));
        assert_eq!(matrix.release_endpoint_disposals(), 1);
        assert_eq!(matrix.fact_count(), 0);
        assert_eq!(matrix.latest(&endpoint), None);
    }
}
