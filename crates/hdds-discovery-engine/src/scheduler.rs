// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sync scheduler: the recurring timer driving re-announcement and trimming.
//!
//! # Tick
//!
//! ```text
//! sleep(period) | awaken() | stop()
//!        |
//!        v
//! SyncTask::run_sync(now)
//!   1. lease expiry
//!   2. reannounce(): pending facts of every peer
//!   3. trim(): retired records whose facts settled
//! ```
//!
//! The passes below only go through the [`ProxyStore`] and
//! [`VisibilityMatrix`] contracts.

use crate::host::Announcer;
use crate::message::OutboundMessage;
use crate::store::ProxyStore;
use crate::types::{prefix_to_hex, ParticipantRecord};
use crate::visibility::VisibilityMatrix;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Participants dropped on lease expiry.
    pub expired: usize,
    /// Facts resent to peers.
    pub announced: usize,
    /// Retired participants deleted.
    pub trimmed: usize,
    /// Settled facts discarded.
    pub compacted: usize,
}

impl SyncReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Work performed on every tick.
pub trait SyncTask: Send + Sync {
    fn run_sync(&self, now: Instant) -> SyncReport;
}

#[derive(Debug)]
struct AwakenerState {
    notify: Notify,
    pending: AtomicBool,
    next_tick: Mutex<Instant>,
    imminence: Duration,
}

/// Requests an out-of-schedule tick.
#[derive(Debug, Clone)]
pub struct Awakener {
    inner: Arc<AwakenerState>,
}

impl Awakener {
    pub fn new(imminence: Duration) -> Self {
        Self {
            inner: Arc::new(AwakenerState {
                notify: Notify::new(),
                pending: AtomicBool::new(false),
                next_tick: Mutex::new(Instant::now()),
                imminence,
            }),
        }
    }

    /// Ask for an early tick.
    ///
    /// No-op (returns false) when a wake-up is already pending or the next
    /// natural tick is within the imminence window.
    pub fn awaken(&self) -> bool {
        if self.inner.pending.load(Ordering::Acquire) {
            return false;
        }
        let next_tick = *self.inner.next_tick.lock();
        if next_tick.saturating_duration_since(Instant::now()) <= self.inner.imminence {
            return false;
        }
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.notify.notify_one();
        true
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_tick(&self, at: Instant) {
        *self.inner.next_tick.lock() = at;
    }

    async fn woken(&self) {
        self.inner.notify.notified().await;
        self.inner.pending.store(false, Ordering::Release);
    }
}

/// Recurring timer running a [`SyncTask`].
pub struct SyncScheduler {
    period: Duration,
    awakener: Awakener,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(period: Duration, awakener: Awakener) -> Self {
        Self {
            period,
            awakener,
            shutdown: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the timer task on the current tokio runtime.
    ///
    /// Returns false if it is already running.
    pub fn start(&self, task: Arc<dyn SyncTask>) -> bool {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return false;
        }

        let period = self.period;
        let awakener = self.awakener.clone();
        let shutdown = Arc::clone(&self.shutdown);

        *handle = Some(tokio::spawn(async move {
            loop {
                let next = Instant::now() + period;
                awakener.set_next_tick(next);

                tokio::select! {
                    biased;
                    _ = shutdown.notified() => {
                        debug!("Sync scheduler shutting down");
                        break;
                    }
                    _ = awakener.woken() => {
                        debug!("Sync scheduler awakened early");
                    }
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(next)) => {}
                }

                let report = task.run_sync(Instant::now());
                if !report.is_idle() {
                    debug!(
                        "Sync tick: expired={} announced={} trimmed={} compacted={}",
                        report.expired, report.announced, report.trimmed, report.compacted
                    );
                }
            }
        }));
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Stop the timer and wait for the running tick, if any, to finish.
    pub async fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        self.shutdown.notify_one();
        if let Err(e) = handle.await {
            error!("Sync scheduler task failed: {}", e);
        }
    }
}

/// Resend every pending fact to every peer. Returns how many were sent.
///
/// Each fact is re-checked against the store right before sending; facts no
/// longer backed by a record are skipped. A refused send ends the pass for
/// that peer.
pub fn reannounce(store: &ProxyStore, matrix: &VisibilityMatrix, announcer: &dyn Announcer) -> usize {
    let mut sent = 0;
    for peer in matrix.peers() {
        for id in matrix.pending_for(&peer) {
            let Some(fact) = matrix.fact(id) else {
                continue;
            };
            let Some(message) = OutboundMessage::for_fact(store, id, &fact) else {
                debug!("Dropping stale send of fact {} to {}", id, prefix_to_hex(&peer));
                continue;
            };
            if !announcer.send(&peer, message) {
                debug!("Peer {} not accepting, retry next tick", prefix_to_hex(&peer));
                break;
            }
            sent += 1;
        }
    }
    sent
}

/// Delete retired participants stable for `grace` whose facts every peer settled.
pub fn trim(
    store: &ProxyStore,
    matrix: &VisibilityMatrix,
    grace: Duration,
    now: Instant,
) -> Vec<Arc<ParticipantRecord>> {
    store
        .retired_for(grace, now)
        .into_iter()
        .filter(|record| matrix.participant_settled(&record.id()))
        .filter_map(|record| {
            let purged = store.purge_participant(&record.id())?;
            matrix.forget_participant(&purged.id());
            Some(purged)
        })
        .collect()
}
