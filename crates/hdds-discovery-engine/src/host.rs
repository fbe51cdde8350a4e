// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callbacks the engine consumes from the surrounding middleware.
//!
//! The engine decides *when* these are called and with which participant.
//! What they do (creating builtin readers/writers, matching proxies, pushing
//! bytes on a socket) belongs to the host.

use crate::message::OutboundMessage;
use crate::types::{prefix_to_hex, GuidPrefix, ParticipantRecord, RemovalReason};
use thiserror::Error;
use tracing::{debug, info};

/// Host-side failure.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to create discovery endpoints: {0}")]
    EndpointCreation(String),

    #[error("Host unavailable: {0}")]
    Unavailable(String),
}

/// Endpoint management primitives of the hosting participant.
pub trait EndpointHost: Send + Sync {
    /// Create the local builtin discovery endpoints. Failure is fatal to the engine.
    fn create_discovery_endpoints(&self, local: &ParticipantRecord) -> Result<(), HostError>;

    /// Match the local builtin endpoints with those of a remote participant.
    fn assign_remote_endpoints(&self, participant: &ParticipantRecord);

    /// Unmatch the builtin endpoints of a remote participant.
    fn remove_remote_endpoints(&self, participant: &ParticipantRecord);

    /// Tell upper layers about a discovered or updated participant.
    fn notify_above_remote_endpoints(&self, participant: &ParticipantRecord);

    /// A remote participant left, either by lease expiry or disposal.
    fn participant_removed(&self, _participant: &ParticipantRecord, _reason: RemovalReason) {}
}

/// Outbound path towards peers.
pub trait Announcer: Send + Sync {
    /// Queue `message` for `peer`. Returns false if the peer cannot take it now.
    fn send(&self, peer: &GuidPrefix, message: OutboundMessage) -> bool;
}

/// Host used by the standalone server: there is no local middleware to
/// wire endpoints into, so every callback is logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHost;

impl EndpointHost for LoggingHost {
    fn create_discovery_endpoints(&self, local: &ParticipantRecord) -> Result<(), HostError> {
        info!(
            "Discovery endpoints ready for {}",
            prefix_to_hex(&local.id())
        );
        Ok(())
    }

    fn assign_remote_endpoints(&self, participant: &ParticipantRecord) {
        debug!(
            "Assigned builtin endpoints of {} ({:?})",
            prefix_to_hex(&participant.id()),
            participant.data.role
        );
    }

    fn remove_remote_endpoints(&self, participant: &ParticipantRecord) {
        debug!(
            "Removed builtin endpoints of {}",
            prefix_to_hex(&participant.id())
        );
    }

    fn notify_above_remote_endpoints(&self, participant: &ParticipantRecord) {
        debug!(
            "Participant {} seq {} visible",
            prefix_to_hex(&participant.id()),
            participant.sequence
        );
    }

    fn participant_removed(&self, participant: &ParticipantRecord, reason: RemovalReason) {
        info!(
            "Participant {} removed ({:?})",
            prefix_to_hex(&participant.id()),
            reason
        );
    }
}
