// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery service wire protocol.
//!
//! Length-prefixed JSON, one message per frame. This is the HDDS discovery
//! service transport, not interoperable with other vendors' servers.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```
//!
//! GUID prefixes and entity ids travel as lowercase hex strings.

use crate::message::{InboundMessage, OutboundMessage};
use crate::types::{
    encode_hex, entity_id_from_hex, prefix_from_hex, prefix_to_hex, EndpointData, EndpointKind,
    EntityId, Guid, GuidPrefix, ParticipantData, ParticipantRole, ENTITYID_SPDP_WRITER,
    VENDOR_ID_HDDS,
};
use crate::visibility::FactId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Error code: the message could not be decoded.
pub const ERROR_MALFORMED: u32 = 1;

/// Discovery protocol message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// DATA(p).
    #[serde(rename = "participant_data")]
    ParticipantData {
        #[serde(default)]
        change: Option<FactId>,
        sequence: u64,
        /// Announcing writer, defaults to the participant's SPDP writer.
        #[serde(default)]
        writer: Option<EntityIdWire>,
        participant: ParticipantDataWire,
    },

    /// Participant disposal.
    #[serde(rename = "participant_dispose")]
    ParticipantDispose {
        #[serde(default)]
        change: Option<FactId>,
        guid_prefix: GuidPrefixWire,
        sequence: u64,
    },

    /// DATA(w) / DATA(r).
    #[serde(rename = "endpoint_data")]
    EndpointData {
        #[serde(default)]
        change: Option<FactId>,
        sequence: u64,
        endpoint: EndpointDataWire,
    },

    /// Endpoint disposal.
    #[serde(rename = "endpoint_dispose")]
    EndpointDispose {
        #[serde(default)]
        change: Option<FactId>,
        guid_prefix: GuidPrefixWire,
        entity_id: EntityIdWire,
        sequence: u64,
    },

    /// Acknowledgment of received changes.
    #[serde(rename = "ack")]
    Ack {
        from: GuidPrefixWire,
        changes: Vec<FactId>,
    },

    /// Heartbeat to keep lease alive.
    #[serde(rename = "heartbeat")]
    Heartbeat { guid_prefix: GuidPrefixWire },

    /// Error message.
    #[serde(rename = "error")]
    Error { code: u32, message: String },
}

impl WireMessage {
    /// Ack for `changes`, sent by `from`.
    pub fn ack(from: &GuidPrefix, changes: Vec<FactId>) -> Self {
        Self::Ack {
            from: from.into(),
            changes,
        }
    }

    /// Decode into an engine message. `Error` frames are not inbound discovery data.
    pub fn into_inbound(self) -> Result<InboundMessage, ProtocolError> {
        match self {
            Self::ParticipantData {
                change,
                sequence,
                writer,
                participant,
            } => {
                let data = ParticipantData::try_from(participant)?;
                let entity_id = match writer {
                    Some(wire) => wire.try_into()?,
                    None => ENTITYID_SPDP_WRITER,
                };
                Ok(InboundMessage::ParticipantData {
                    change,
                    writer: Guid::new(data.guid_prefix, entity_id),
                    data,
                    sequence,
                })
            }
            Self::ParticipantDispose {
                change,
                guid_prefix,
                sequence,
            } => Ok(InboundMessage::ParticipantDisposed {
                change,
                guid_prefix: guid_prefix.try_into()?,
                sequence,
            }),
            Self::EndpointData {
                change,
                sequence,
                endpoint,
            } => Ok(InboundMessage::EndpointData {
                change,
                data: endpoint.try_into()?,
                sequence,
            }),
            Self::EndpointDispose {
                change,
                guid_prefix,
                entity_id,
                sequence,
            } => Ok(InboundMessage::EndpointDisposed {
                change,
                guid: Guid::new(guid_prefix.try_into()?, entity_id.try_into()?),
                sequence,
            }),
            Self::Ack { from, changes } => Ok(InboundMessage::Ack {
                from: from.try_into()?,
                changes,
            }),
            Self::Heartbeat { guid_prefix } => Ok(InboundMessage::Liveliness {
                guid_prefix: guid_prefix.try_into()?,
            }),
            Self::Error { code, .. } => Err(ProtocolError::InvalidMessage(format!(
                "error frame {} is not discovery data",
                code
            ))),
        }
    }
}

impl From<OutboundMessage> for WireMessage {
    fn from(message: OutboundMessage) -> Self {
        match message {
            OutboundMessage::Participant {
                change,
                data,
                sequence,
                writer,
            } => Self::ParticipantData {
                change,
                sequence,
                writer: Some(writer.entity_id.into()),
                participant: data.into(),
            },
            OutboundMessage::ParticipantDisposed {
                change,
                guid_prefix,
                sequence,
            } => Self::ParticipantDispose {
                change,
                guid_prefix: guid_prefix.into(),
                sequence,
            },
            OutboundMessage::Endpoint {
                change,
                data,
                sequence,
            } => Self::EndpointData {
                change,
                sequence,
                endpoint: data.into(),
            },
            OutboundMessage::EndpointDisposed {
                change,
                guid,
                sequence,
            } => Self::EndpointDispose {
                change,
                guid_prefix: guid.prefix.into(),
                entity_id: guid.entity_id.into(),
                sequence,
            },
        }
    }
}

/// Wire format for GUID prefix (hex string for JSON compatibility).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct GuidPrefixWire(pub String);

impl From<GuidPrefix> for GuidPrefixWire {
    fn from(gp: GuidPrefix) -> Self {
        Self(prefix_to_hex(&gp))
    }
}

impl From<&GuidPrefix> for GuidPrefixWire {
    fn from(gp: &GuidPrefix) -> Self {
        Self(prefix_to_hex(gp))
    }
}

impl TryFrom<GuidPrefixWire> for GuidPrefix {
    type Error = ProtocolError;

    fn try_from(wire: GuidPrefixWire) -> Result<Self, Self::Error> {
        prefix_from_hex(&wire.0).ok_or(ProtocolError::InvalidGuidPrefix)
    }
}

/// Wire format for Entity ID (hex string).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EntityIdWire(pub String);

impl From<EntityId> for EntityIdWire {
    fn from(eid: EntityId) -> Self {
        Self(encode_hex(&eid))
    }
}

impl TryFrom<EntityIdWire> for EntityId {
    type Error = ProtocolError;

    fn try_from(wire: EntityIdWire) -> Result<Self, Self::Error> {
        entity_id_from_hex(&wire.0).ok_or(ProtocolError::InvalidEntityId)
    }
}

/// Wire format for a participant descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDataWire {
    pub guid_prefix: GuidPrefixWire,
    #[serde(default)]
    pub domain_id: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub role: ParticipantRole,
    pub lease_duration_ms: u64,
    #[serde(default)]
    pub metatraffic_locators: Vec<String>,
    #[serde(default)]
    pub default_locators: Vec<String>,
    #[serde(default = "default_vendor_id")]
    pub vendor_id: [u8; 2],
    #[serde(default = "default_protocol_version")]
    pub protocol_version: (u8, u8),
    #[serde(default)]
    pub builtin_endpoints: u32,
}

fn default_vendor_id() -> [u8; 2] {
    VENDOR_ID_HDDS
}

fn default_protocol_version() -> (u8, u8) {
    (2, 4)
}

fn locators_to_wire(locators: &[SocketAddr]) -> Vec<String> {
    locators.iter().map(|a| a.to_string()).collect()
}

// Unparseable locators are skipped, the descriptor itself stays usable
fn locators_from_wire(locators: &[String]) -> Vec<SocketAddr> {
    locators.iter().filter_map(|s| s.parse().ok()).collect()
}

impl From<ParticipantData> for ParticipantDataWire {
    fn from(data: ParticipantData) -> Self {
        Self {
            guid_prefix: data.guid_prefix.into(),
            domain_id: data.domain_id,
            name: data.name,
            role: data.role,
            lease_duration_ms: u64::try_from(data.lease_duration.as_millis()).unwrap_or(u64::MAX),
            metatraffic_locators: locators_to_wire(&data.metatraffic_locators),
            default_locators: locators_to_wire(&data.default_locators),
            vendor_id: data.vendor_id,
            protocol_version: data.protocol_version,
            builtin_endpoints: data.builtin_endpoints,
        }
    }
}

impl TryFrom<ParticipantDataWire> for ParticipantData {
    type Error = ProtocolError;

    fn try_from(wire: ParticipantDataWire) -> Result<Self, Self::Error> {
        let guid_prefix: GuidPrefix = wire.guid_prefix.try_into()?;
        let mut data = ParticipantData::new(
            guid_prefix,
            wire.role,
            Duration::from_millis(wire.lease_duration_ms),
        );
        data.domain_id = wire.domain_id;
        data.name = wire.name;
        data.metatraffic_locators = locators_from_wire(&wire.metatraffic_locators);
        data.default_locators = locators_from_wire(&wire.default_locators);
        data.vendor_id = wire.vendor_id;
        data.protocol_version = wire.protocol_version;
        data.builtin_endpoints = wire.builtin_endpoints;
        Ok(data)
    }
}

/// Wire format for an endpoint descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDataWire {
    pub guid_prefix: GuidPrefixWire,
    pub entity_id: EntityIdWire,
    pub topic_name: String,
    pub type_name: String,
    pub is_writer: bool,
    #[serde(default)]
    pub reliable: bool,
    #[serde(default)]
    pub durability: u8,
    #[serde(default)]
    pub unicast_locators: Vec<String>,
}

impl From<EndpointData> for EndpointDataWire {
    fn from(data: EndpointData) -> Self {
        Self {
            guid_prefix: data.guid.prefix.into(),
            entity_id: data.guid.entity_id.into(),
            topic_name: data.topic_name,
            type_name: data.type_name,
            is_writer: data.kind == EndpointKind::Writer,
            reliable: data.reliable,
            durability: data.durability,
            unicast_locators: locators_to_wire(&data.unicast_locators),
        }
    }
}

impl TryFrom<EndpointDataWire> for EndpointData {
    type Error = ProtocolError;

    fn try_from(wire: EndpointDataWire) -> Result<Self, Self::Error> {
        Ok(Self {
            guid: Guid::new(wire.guid_prefix.try_into()?, wire.entity_id.try_into()?),
            topic_name: wire.topic_name,
            type_name: wire.type_name,
            kind: if wire.is_writer {
                EndpointKind::Writer
            } else {
                EndpointKind::Reader
            },
            reliable: wire.reliable,
            durability: wire.durability,
            unicast_locators: locators_from_wire(&wire.unicast_locators),
        })
    }
}

/// Protocol error types.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Invalid GUID prefix")]
    InvalidGuidPrefix,

    #[error("Invalid entity ID")]
    InvalidEntityId,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}
