// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery messages exchanged between the engine and its transport.
//!
//! `change` carries the fact id assigned by the sending server. The receiver
//! echoes it back in an ack so the sender can advance its visibility matrix.

use crate::store::ProxyStore;
use crate::types::{EndpointData, Guid, GuidPrefix, ParticipantData};
use crate::visibility::{Fact, FactId, FactKind, Subject};

/// Message received from a peer or client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// DATA(p): participant created or updated.
    ParticipantData {
        change: Option<FactId>,
        data: ParticipantData,
        sequence: u64,
        writer: Guid,
    },
    /// Participant disposal.
    ParticipantDisposed {
        change: Option<FactId>,
        guid_prefix: GuidPrefix,
        sequence: u64,
    },
    /// DATA(w) / DATA(r): endpoint created or updated.
    EndpointData {
        change: Option<FactId>,
        data: EndpointData,
        sequence: u64,
    },
    /// Endpoint disposal.
    EndpointDisposed {
        change: Option<FactId>,
        guid: Guid,
        sequence: u64,
    },
    /// Acknowledgment of facts this server sent to `from`.
    Ack { from: GuidPrefix, changes: Vec<FactId> },
    /// Lease refresh without a new change.
    Liveliness { guid_prefix: GuidPrefix },
}

impl InboundMessage {
    /// Fact id to acknowledge back to the sender, if any.
    pub fn change(&self) -> Option<FactId> {
        match self {
            Self::ParticipantData { change, .. }
            | Self::ParticipantDisposed { change, .. }
            | Self::EndpointData { change, .. }
            | Self::EndpointDisposed { change, .. } => *change,
            Self::Ack { .. } | Self::Liveliness { .. } => None,
        }
    }
}

/// Message the engine sends to a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Participant {
        change: Option<FactId>,
        data: ParticipantData,
        sequence: u64,
        writer: Guid,
    },
    ParticipantDisposed {
        change: Option<FactId>,
        guid_prefix: GuidPrefix,
        sequence: u64,
    },
    Endpoint {
        change: Option<FactId>,
        data: EndpointData,
        sequence: u64,
    },
    EndpointDisposed {
        change: Option<FactId>,
        guid: Guid,
        sequence: u64,
    },
}

impl OutboundMessage {
    /// Build the message announcing fact `id` from the current store content.
    ///
    /// Returns `None` when the store no longer backs the fact (record gone,
    /// revived, or moved past the fact's sequence). Such sends are dropped.
    pub fn for_fact(store: &ProxyStore, id: FactId, fact: &Fact) -> Option<Self> {
        let change = Some(id);
        match (fact.subject, fact.kind) {
            (Subject::Participant(prefix), FactKind::Announce) => {
                let record = store.participant(&prefix)?;
                (record.is_alive() && record.sequence == fact.sequence).then(|| {
                    Self::Participant {
                        change,
                        data: record.data.clone(),
                        sequence: record.sequence,
                        writer: record.writer,
                    }
                })
            }
            (Subject::Participant(prefix), FactKind::Dispose) => {
                let record = store.participant(&prefix)?;
                (!record.is_alive()).then_some(Self::ParticipantDisposed {
                    change,
                    guid_prefix: prefix,
                    sequence: fact.sequence,
                })
            }
            (Subject::Endpoint(guid), FactKind::Announce) => {
                let record = store.endpoint(&guid)?;
                (record.sequence == fact.sequence).then(|| Self::Endpoint {
                    change,
                    data: record.data.clone(),
                    sequence: record.sequence,
                })
            }
            (Subject::Endpoint(guid), FactKind::Dispose) => {
                store.endpoint(&guid).is_none().then_some(Self::EndpointDisposed {
                    change,
                    guid,
                    sequence: fact.sequence,
                })
            }
        }
    }

    pub fn change(&self) -> Option<FactId> {
        match self {
            Self::Participant { change, .. }
            | Self::ParticipantDisposed { change, .. }
            | Self::Endpoint { change, .. }
            | Self::EndpointDisposed { change, .. } => *change,
        }
    }

    /// Participant the message is about.
    pub fn participant(&self) -> GuidPrefix {
        match self {
            Self::Participant { data, .. } => data.guid_prefix,
            Self::ParticipantDisposed { guid_prefix, .. } => *guid_prefix,
            Self::Endpoint { data, .. } => data.guid.prefix,
            Self::EndpointDisposed { guid, .. } => guid.prefix,
        }
    }

    pub fn is_disposal(&self) -> bool {
        matches!(
            self,
            Self::ParticipantDisposed { .. } | Self::EndpointDisposed { .. }
        )
    }
}
