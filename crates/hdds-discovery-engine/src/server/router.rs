// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer routing table.
//!
//! Maps each peer's GUID prefix to the outbound queue of the link it was
//! last seen on. Sends never block: a full or closed queue is reported as a
//! refusal and the scheduler retries on its next tick.

use super::protocol::WireMessage;
use crate::host::Announcer;
use crate::message::OutboundMessage;
use crate::types::{prefix_to_hex, GuidPrefix};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

/// Routing statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Messages queued to a link.
    pub messages_routed: u64,
    /// Messages refused because the link queue was full.
    pub queue_full: u64,
    /// Messages for peers with no link, or a closed one.
    pub unroutable: u64,
}

/// Peer GUID prefix to link queue.
#[derive(Default)]
pub struct PeerRouter {
    links: RwLock<HashMap<GuidPrefix, mpsc::Sender<WireMessage>>>,
    routed: AtomicU64,
    queue_full: AtomicU64,
    unroutable: AtomicU64,
}

impl PeerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `peer` through `tx`, replacing any previous link.
    pub fn register(&self, peer: GuidPrefix, tx: mpsc::Sender<WireMessage>) {
        debug!("Routing {} through new link", prefix_to_hex(&peer));
        self.links.write().insert(peer, tx);
    }

    /// Remove the route for `peer` only if it still points at `tx`.
    ///
    /// A peer that reconnected keeps its newer route.
    pub fn unregister_if(&self, peer: &GuidPrefix, tx: &mpsc::Sender<WireMessage>) -> bool {
        let mut links = self.links.write();
        match links.get(peer) {
            Some(current) if current.same_channel(tx) => {
                links.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// Queue a message for `peer`.
    pub fn route(&self, peer: &GuidPrefix, message: WireMessage) -> bool {
        let links = self.links.read();
        let Some(tx) = links.get(peer) else {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            trace!("No link for {}", prefix_to_hex(peer));
            return false;
        };

        match tx.try_send(message) {
            Ok(()) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.queue_full.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.unroutable.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Queue a message for every routed peer. Returns how many accepted it.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let peers: Vec<GuidPrefix> = self.links.read().keys().copied().collect();
        peers
            .iter()
            .filter(|peer| self.route(peer, message.clone()))
            .count()
    }

    /// Drop every route, closing the link queues once their tasks finish.
    pub fn clear(&self) {
        self.links.write().clear();
    }

    pub fn is_routed(&self, peer: &GuidPrefix) -> bool {
        self.links.read().contains_key(peer)
    }

    pub fn connection_count(&self) -> usize {
        self.links.read().len()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_routed: self.routed.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
        }
    }
}

impl Announcer for PeerRouter {
    fn send(&self, peer: &GuidPrefix, message: OutboundMessage) -> bool {
        self.route(peer, message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(id: u8) -> WireMessage {
        WireMessage::Heartbeat {
            guid_prefix: [id; 12].into(),
        }
    }

    #[test]
    fn test_route_to_registered_peer() {
        let router = PeerRouter::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.register([1; 12], tx);

        assert!(router.route(&[1; 12], heartbeat(1)));
        assert!(!router.route(&[2; 12], heartbeat(2)));
        assert_eq!(rx.try_recv().unwrap(), heartbeat(1));

        let stats = router.stats();
        assert_eq!(stats.messages_routed, 1);
        assert_eq!(stats.unroutable, 1);
    }

    #[test]
    fn test_full_queue_refuses() {
        let router = PeerRouter::new();
        let (tx, _rx) = mpsc::channel(1);
        router.register([1; 12], tx);

        assert!(router.route(&[1; 12], heartbeat(1)));
        assert!(!router.route(&[1; 12], heartbeat(1)));
        assert_eq!(router.stats().queue_full, 1);
    }

    #[test]
    fn test_closed_queue_refuses() {
        let router = PeerRouter::new();
        let (tx, rx) = mpsc::channel(1);
        router.register([1; 12], tx);
        drop(rx);
        assert!(!router.route(&[1; 12], heartbeat(1)));
    }

    #[test]
    fn test_unregister_keeps_newer_link() {
        let router = PeerRouter::new();
        let (old_tx, _old_rx) = mpsc::channel(1);
        let (new_tx, _new_rx) = mpsc::channel(1);
        router.register([1; 12], old_tx.clone());
        router.register([1; 12], new_tx.clone());

        assert!(!router.unregister_if(&[1; 12], &old_tx));
        assert!(router.is_routed(&[1; 12]));
        assert!(router.unregister_if(&[1; 12], &new_tx));
        assert_eq!(router.connection_count(), 0);
    }

    #[test]
    fn test_broadcast_and_announcer() {
        let router = PeerRouter::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        router.register([1; 12], tx1);
        router.register([2; 12], tx2);

        assert_eq!(router.broadcast(&heartbeat(9)), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        let sent = Announcer::send(
            &router,
            &[2; 12],
            OutboundMessage::ParticipantDisposed {
                change: Some(3),
                guid_prefix: [5; 12],
                sequence: 2,
            },
        );
        assert!(sent);
        assert!(matches!(
            rx2.try_recv().unwrap(),
            WireMessage::ParticipantDispose { sequence: 2, .. }
        ));

        router.clear();
        assert_eq!(router.connection_count(), 0);
    }
}
