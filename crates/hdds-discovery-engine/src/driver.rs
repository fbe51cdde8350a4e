// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Generic discovery driver.
//!
//! The driver validates inbound messages at the boundary and dispatches them
//! to a [`DiscoveryProtocol`]. It knows nothing about server or peer-to-peer
//! mode; the protocol implementation decides what a message means.

use crate::error::EngineError;
use crate::message::InboundMessage;
use crate::types::{
    prefix_to_hex, EndpointData, EndpointRecord, Guid, GuidPrefix, ParticipantData,
    ParticipantRecord, RemovalReason,
};
use crate::visibility::FactId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Capabilities a discovery protocol exposes to the driver.
///
/// Only the participant lifecycle is mandatory. Protocols without endpoint
/// tracking or acknowledgments keep the default no-op behavior.
pub trait DiscoveryProtocol: Send + Sync {
    fn init(&self, local: ParticipantData) -> Result<(), EngineError>;

    fn create_or_update_participant_proxy(
        &self,
        data: ParticipantData,
        sequence: u64,
        writer: Guid,
    ) -> Option<Arc<ParticipantRecord>>;

    fn remove_remote_participant(&self, id: &GuidPrefix, reason: RemovalReason) -> bool;

    fn announce_participant_state(&self, force_new_change: bool, dispose: bool);

    fn dispose_participant_proxy(&self, id: &GuidPrefix, _sequence: u64) -> bool {
        self.remove_remote_participant(id, RemovalReason::Disposed)
    }

    fn create_or_update_endpoint_proxy(
        &self,
        _data: EndpointData,
        _sequence: u64,
    ) -> Option<Arc<EndpointRecord>> {
        None
    }

    fn remove_endpoint_proxy(&self, _guid: &Guid, _sequence: Option<u64>) -> bool {
        false
    }

    fn acknowledge(&self, _peer: &GuidPrefix, _changes: &[FactId]) -> usize {
        0
    }

    fn assert_liveliness(&self, _id: &GuidPrefix) -> bool {
        false
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Handled {
    /// Fact id to acknowledge back to the sender.
    pub ack: Option<FactId>,
    /// The message changed or confirmed engine state.
    pub applied: bool,
}

/// Driver counters.
#[derive(Debug, Default)]
pub struct DriverStats {
    pub received: AtomicU64,
    pub applied: AtomicU64,
    pub rejected: AtomicU64,
}

/// Dispatches inbound discovery messages to a protocol.
pub struct DiscoveryDriver<P: DiscoveryProtocol + ?Sized> {
    protocol: Arc<P>,
    stats: DriverStats,
}

impl<P: DiscoveryProtocol + ?Sized> DiscoveryDriver<P> {
    pub fn new(protocol: Arc<P>) -> Self {
        Self {
            protocol,
            stats: DriverStats::default(),
        }
    }

    /// Initialize the protocol for the local participant.
    pub fn start(&self, local: ParticipantData) -> Result<(), EngineError> {
        self.protocol.init(local)
    }

    /// Announce the local participant's departure.
    pub fn shutdown(&self) {
        self.protocol.announce_participant_state(false, true);
    }

    /// Handle one inbound message.
    ///
    /// Well-formed changes are acknowledged even when stale or duplicate so
    /// the sender stops resending them. Malformed ones are not.
    pub fn handle(&self, message: InboundMessage) -> Handled {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let change = message.change();

        let handled = match message {
            InboundMessage::ParticipantData {
                data,
                sequence,
                writer,
                ..
            } => {
                if let Err(e) = data.validate() {
                    return self.reject(e);
                }
                let applied = self
                    .protocol
                    .create_or_update_participant_proxy(data, sequence, writer)
                    .is_some();
                Handled {
                    ack: change.filter(|_| applied),
                    applied,
                }
            }
            InboundMessage::ParticipantDisposed {
                guid_prefix,
                sequence,
                ..
            } => Handled {
                ack: change,
                applied: self.protocol.dispose_participant_proxy(&guid_prefix, sequence),
            },
            InboundMessage::EndpointData { data, sequence, .. } => {
                if let Err(e) = data.validate() {
                    return self.reject(e);
                }
                let applied = self
                    .protocol
                    .create_or_update_endpoint_proxy(data, sequence)
                    .is_some();
                Handled {
                    ack: change.filter(|_| applied),
                    applied,
                }
            }
            InboundMessage::EndpointDisposed { guid, sequence, .. } => Handled {
                ack: change,
                applied: self.protocol.remove_endpoint_proxy(&guid, Some(sequence)),
            },
            InboundMessage::Ack { from, changes } => {
                let accepted = self.protocol.acknowledge(&from, &changes);
                debug!(
                    "{} of {} acks accepted from {}",
                    accepted,
                    changes.len(),
                    prefix_to_hex(&from)
                );
                Handled {
                    ack: None,
                    applied: accepted > 0,
                }
            }
            InboundMessage::Liveliness { guid_prefix } => Handled {
                ack: None,
                applied: self.protocol.assert_liveliness(&guid_prefix),
            },
        };

        if handled.applied {
            self.stats.applied.fetch_add(1, Ordering::Relaxed);
        }
        handled
    }

    fn reject(&self, error: EngineError) -> Handled {
        warn!("Dropping inbound message: {}", error);
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        Handled::default()
    }

    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Origin, ParticipantRole, ParticipantStatus};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::time::Duration;

    /// Peer-to-peer style protocol: participant lifecycle only.
    #[derive(Default)]
    struct MinimalProtocol {
        removed: Mutex<Vec<(GuidPrefix, RemovalReason)>>,
    }

    impl DiscoveryProtocol for MinimalProtocol {
        fn init(&self, _local: ParticipantData) -> Result<(), EngineError> {
            Ok(())
        }

        fn create_or_update_participant_proxy(
            &self,
            data: ParticipantData,
            sequence: u64,
            writer: Guid,
        ) -> Option<Arc<ParticipantRecord>> {
            Some(Arc::new(ParticipantRecord {
                data,
                origin: Origin::Remote,
                sequence,
                writer,
                endpoints: BTreeSet::new(),
                status: ParticipantStatus::Alive,
            }))
        }

        fn remove_remote_participant(&self, id: &GuidPrefix, reason: RemovalReason) -> bool {
            self.removed.lock().push((*id, reason));
            true
        }

        fn announce_participant_state(&self, _force_new_change: bool, _dispose: bool) {}
    }

    fn participant_message(lease: Duration) -> InboundMessage {
        InboundMessage::ParticipantData {
            change: Some(4),
            data: ParticipantData::new([1; 12], ParticipantRole::Client, lease),
            sequence: 1,
            writer: Guid::spdp_writer([1; 12]),
        }
    }

    #[test]
    fn test_valid_participant_acked() {
        let driver = DiscoveryDriver::new(Arc::new(MinimalProtocol::default()));
        let handled = driver.handle(participant_message(Duration::from_secs(5)));
        assert_eq!(
            handled,
            Handled {
                ack: Some(4),
                applied: true
            }
        );
        assert_eq!(driver.stats().applied.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_malformed_participant_not_acked() {
        let driver = DiscoveryDriver::new(Arc::new(MinimalProtocol::default()));
        let handled = driver.handle(participant_message(Duration::ZERO));
        assert_eq!(handled, Handled::default());
        assert_eq!(driver.stats().rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_disposal_uses_default_capability() {
        let protocol = Arc::new(MinimalProtocol::default());
        let driver = DiscoveryDriver::new(protocol.clone());
        let handled = driver.handle(InboundMessage::ParticipantDisposed {
            change: Some(9),
            guid_prefix: [1; 12],
            sequence: 2,
        });
        assert_eq!(handled.ack, Some(9));
        assert_eq!(
            protocol.removed.lock().as_slice(),
            &[([1; 12], RemovalReason::Disposed)]
        );
    }

    #[test]
    fn test_optional_capabilities_default_to_noop() {
        let driver = DiscoveryDriver::new(Arc::new(MinimalProtocol::default()));
        let handled = driver.handle(InboundMessage::Ack {
            from: [2; 12],
            changes: vec![1, 2, 3],
        });
        assert!(!handled.applied);

        let handled = driver.handle(InboundMessage::Liveliness {
            guid_prefix: [2; 12],
        });
        assert!(!handled.applied);
        assert_eq!(driver.stats().received.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_driver_over_trait_object() {
        let protocol: Arc<dyn DiscoveryProtocol> = Arc::new(MinimalProtocol::default());
        let driver = DiscoveryDriver::new(protocol);
        assert!(driver
            .start(ParticipantData::new(
                [7; 12],
                ParticipantRole::Server,
                Duration::from_secs(20)
            ))
            .is_ok());
        driver.shutdown();
    }
}
