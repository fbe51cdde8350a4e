// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background persistence worker.
//!
//! Facts are queued on an unbounded channel and applied in order on a
//! dedicated thread. The first failing apply flips the worker into degraded
//! mode: later facts are dropped and the engine keeps running in-memory.

use super::{DiscoveryPersistence, PersistedFact};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

enum Command {
    Apply(PersistedFact),
    Flush(oneshot::Sender<()>),
    Stop,
}

#[derive(Default)]
struct WorkerStats {
    degraded: AtomicBool,
    applied: AtomicU64,
    failures: AtomicU64,
}

/// Handle to the persistence thread.
pub struct PersistenceWorker {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<WorkerStats>,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceWorker {
    /// Spawn the worker thread over `backend`.
    pub fn spawn(backend: Arc<dyn DiscoveryPersistence>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let stats = Arc::new(WorkerStats::default());
        let thread_stats = Arc::clone(&stats);

        let thread = std::thread::Builder::new()
            .name("dserver-persist".into())
            .spawn(move || {
                while let Some(cmd) = rx.blocking_recv() {
                    match cmd {
                        Command::Apply(fact) => {
                            if thread_stats.degraded.load(Ordering::Acquire) {
                                continue;
                            }
                            match backend.apply(&fact) {
                                Ok(()) => {
                                    thread_stats.applied.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    thread_stats.failures.fetch_add(1, Ordering::Relaxed);
                                    thread_stats.degraded.store(true, Ordering::Release);
                                    error!(
                                        "Persistence apply failed, continuing in-memory only: {:#}",
                                        e
                                    );
                                }
                            }
                        }
                        Command::Flush(done) => {
                            let _ = done.send(());
                        }
                        Command::Stop => break,
                    }
                }
                debug!("Persistence worker stopped");
            })?;

        Ok(Self {
            tx,
            stats,
            thread: parking_lot::Mutex::new(Some(thread)),
        })
    }

    /// Queue a fact. Returns false when the fact was not queued.
    pub fn submit(&self, fact: PersistedFact) -> bool {
        if self.is_degraded() {
            return false;
        }
        self.tx.send(Command::Apply(fact)).is_ok()
    }

    /// Wait until every fact queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Switch to in-memory operation.
    pub fn mark_degraded(&self, reason: &str) {
        if !self.stats.degraded.swap(true, Ordering::AcqRel) {
            warn!("Persistence degraded: {}", reason);
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.stats.degraded.load(Ordering::Acquire)
    }

    pub fn applied(&self) -> u64 {
        self.stats.applied.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    /// Stop the thread after draining queued commands.
    pub fn stop(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let _ = self.tx.send(Command::Stop);
        if thread.join().is_err() {
            error!("Persistence worker panicked");
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{PersistedSnapshot, SqlitePersistence};
    use anyhow::{anyhow, Result};

    struct FailingPersistence;

    impl DiscoveryPersistence for FailingPersistence {
        fn load(&self) -> Result<Option<PersistedSnapshot>> {
            Ok(None)
        }

        fn apply(&self, _fact: &PersistedFact) -> Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    #[tokio::test]
    async fn test_worker_applies_in_order() {
        let backend = Arc::new(SqlitePersistence::new_in_memory().unwrap());
        let worker = PersistenceWorker::spawn(backend.clone()).unwrap();

        assert!(worker.submit(PersistedFact::ParticipantPurged([1; 12])));
        assert!(worker.submit(PersistedFact::ParticipantPurged([2; 12])));
        worker.flush().await;

        assert_eq!(worker.applied(), 2);
        assert!(!worker.is_degraded());
        worker.stop();
    }

    #[tokio::test]
    async fn test_failure_degrades_worker() {
        let worker = PersistenceWorker::spawn(Arc::new(FailingPersistence)).unwrap();

        assert!(worker.submit(PersistedFact::ParticipantPurged([1; 12])));
        worker.flush().await;

        assert!(worker.is_degraded());
        assert_eq!(worker.failures(), 1);
        assert!(!worker.submit(PersistedFact::ParticipantPurged([2; 12])));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let worker = PersistenceWorker::spawn(Arc::new(super::super::NoopPersistence)).unwrap();
        worker.mark_degraded("test");
        worker.stop();
        worker.stop();
        assert!(worker.is_degraded());
    }
}
