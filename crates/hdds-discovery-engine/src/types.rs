// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identities, descriptors and proxy records tracked by the discovery engine.
//!
//! Only the fields the engine reasons about are modeled here. Topic and type
//! descriptors of endpoints are opaque strings, locators are plain socket
//! addresses.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// GUID prefix (12 bytes) - unique participant identifier.
pub type GuidPrefix = [u8; 12];

/// Entity ID (4 bytes) - unique endpoint identifier within a participant.
pub type EntityId = [u8; 4];

/// Entity ID of the participant itself.
pub const ENTITYID_PARTICIPANT: EntityId = [0x00, 0x00, 0x01, 0xc1];

/// Entity ID of the builtin participant announcer (SPDP writer).
pub const ENTITYID_SPDP_WRITER: EntityId = [0x00, 0x01, 0x00, 0xc2];

/// Unknown / unset entity ID.
pub const ENTITYID_UNKNOWN: EntityId = [0x00; 4];

/// HDDS vendor ID.
pub const VENDOR_ID_HDDS: [u8; 2] = [0x01, 0x10];

/// Full GUID = GuidPrefix + EntityId.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid {
    pub prefix: GuidPrefix,
    pub entity_id: EntityId,
}

impl Guid {
    pub fn new(prefix: GuidPrefix, entity_id: EntityId) -> Self {
        Self { prefix, entity_id }
    }

    /// GUID of a participant entity.
    pub fn participant(prefix: GuidPrefix) -> Self {
        Self::new(prefix, ENTITYID_PARTICIPANT)
    }

    /// GUID of a participant's builtin announcer.
    pub fn spdp_writer(prefix: GuidPrefix) -> Self {
        Self::new(prefix, ENTITYID_SPDP_WRITER)
    }

    /// 16-byte flat representation (prefix followed by entity id).
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..12].copy_from_slice(&self.prefix);
        out[12..].copy_from_slice(&self.entity_id);
        out
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}",
            prefix_to_hex(&self.prefix),
            encode_hex(&self.entity_id)
        )
    }
}

/// Hex representation of a GUID prefix, used in logs, file names and on the wire.
pub fn prefix_to_hex(prefix: &GuidPrefix) -> String {
    encode_hex(prefix)
}

/// Parse a 24-character hex GUID prefix.
pub fn prefix_from_hex(s: &str) -> Option<GuidPrefix> {
    let bytes = decode_hex(s)?;
    bytes.try_into().ok()
}

/// Parse an 8-character hex entity ID.
pub fn entity_id_from_hex(s: &str) -> Option<EntityId> {
    let bytes = decode_hex(s)?;
    bytes.try_into().ok()
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Role a participant plays in the discovery mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// Another discovery server.
    Server,
    /// A participant registered with this server.
    Client,
    /// A participant known only through relayed discovery data.
    Simple,
}

impl ParticipantRole {
    /// Peers synchronize discovery state through this server and acknowledge facts.
    pub fn is_peer(self) -> bool {
        matches!(self, Self::Server | Self::Client)
    }
}

/// Participant descriptor as received in a DATA(p).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantData {
    /// Unique GUID prefix
    pub guid_prefix: GuidPrefix,

    /// Domain ID
    pub domain_id: u32,

    /// Participant name (optional)
    #[serde(default)]
    pub name: Option<String>,

    /// Role in the discovery mesh
    pub role: ParticipantRole,

    /// Liveliness lease duration
    pub lease_duration: Duration,

    /// Locators for discovery traffic
    #[serde(default)]
    pub metatraffic_locators: Vec<SocketAddr>,

    /// Default unicast locators for user data
    #[serde(default)]
    pub default_locators: Vec<SocketAddr>,

    /// Vendor ID
    pub vendor_id: [u8; 2],

    /// Protocol version
    pub protocol_version: (u8, u8),

    /// Built-in endpoint set (bitmask)
    #[serde(default)]
    pub builtin_endpoints: u32,
}

impl ParticipantData {
    /// Create a descriptor with HDDS defaults.
    pub fn new(guid_prefix: GuidPrefix, role: ParticipantRole, lease_duration: Duration) -> Self {
        Self {
            guid_prefix,
            domain_id: 0,
            name: None,
            role,
            lease_duration,
            metatraffic_locators: Vec::new(),
            default_locators: Vec::new(),
            vendor_id: VENDOR_ID_HDDS,
            protocol_version: (2, 4),
            builtin_endpoints: 0,
        }
    }

    /// Reject descriptors that cannot describe a real participant.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.guid_prefix == [0u8; 12] {
            return Err(EngineError::MalformedDescriptor(
                "participant GUID prefix is unset".into(),
            ));
        }
        if self.lease_duration.is_zero() {
            return Err(EngineError::MalformedDescriptor(format!(
                "participant {} announces a zero lease",
                prefix_to_hex(&self.guid_prefix)
            )));
        }
        if self.protocol_version.0 < 2 {
            return Err(EngineError::MalformedDescriptor(format!(
                "unsupported protocol version {}.{}",
                self.protocol_version.0, self.protocol_version.1
            )));
        }
        Ok(())
    }
}

/// Endpoint direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Writer,
    Reader,
}

/// Endpoint descriptor as received in a DATA(w) / DATA(r).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointData {
    /// Full GUID (prefix + entity_id)
    pub guid: Guid,

    /// Topic name
    pub topic_name: String,

    /// Type name
    pub type_name: String,

    /// Publishing or subscribing
    pub kind: EndpointKind,

    /// Reliability QoS (true = reliable, false = best-effort)
    #[serde(default)]
    pub reliable: bool,

    /// Durability kind (0 = volatile, 1 = transient_local, etc.)
    #[serde(default)]
    pub durability: u8,

    /// Unicast locators for this endpoint
    #[serde(default)]
    pub unicast_locators: Vec<SocketAddr>,
}

impl EndpointData {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.guid.prefix == [0u8; 12] {
            return Err(EngineError::MalformedDescriptor(
                "endpoint GUID prefix is unset".into(),
            ));
        }
        if self.guid.entity_id == ENTITYID_UNKNOWN || self.guid.entity_id == ENTITYID_PARTICIPANT {
            return Err(EngineError::MalformedDescriptor(format!(
                "endpoint {} has a non-endpoint entity id",
                self.guid
            )));
        }
        if self.topic_name.is_empty() || self.type_name.is_empty() {
            return Err(EngineError::MalformedDescriptor(format!(
                "endpoint {} has an empty topic or type name",
                self.guid
            )));
        }
        Ok(())
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

/// Removal status of a participant record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Alive,
    /// Lease expired.
    Dropped,
    /// Explicitly disposed.
    Removed,
}

/// Why a participant is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// Lease expired, the participant never said goodbye.
    Dropped,
    /// Explicit disposal message.
    Disposed,
}

impl RemovalReason {
    pub fn status(self) -> ParticipantStatus {
        match self {
            Self::Dropped => ParticipantStatus::Dropped,
            Self::Disposed => ParticipantStatus::Removed,
        }
    }
}

/// A known participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub data: ParticipantData,
    pub origin: Origin,
    /// Last applied sequence number from the announcing writer.
    pub sequence: u64,
    /// Writer that announced the last applied change.
    pub writer: Guid,
    /// Endpoints currently owned by this participant.
    pub endpoints: BTreeSet<Guid>,
    pub status: ParticipantStatus,
}

impl ParticipantRecord {
    pub fn id(&self) -> GuidPrefix {
        self.data.guid_prefix
    }

    pub fn is_alive(&self) -> bool {
        self.status == ParticipantStatus::Alive
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}

/// A known endpoint. Never outlives its owning participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub data: EndpointData,
    /// Owning participant (back-reference).
    pub owner: GuidPrefix,
    pub sequence: u64,
    /// Set once the owner's remote endpoints have been assigned by the host.
    #[serde(default)]
    pub matched: bool,
}

impl EndpointRecord {
    pub fn guid(&self) -> Guid {
        self.data.guid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_hex_roundtrip() {
        let gp: GuidPrefix = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 0xff];
        let hex = prefix_to_hex(&gp);
        assert_eq!(hex, "0102030405060708090a0bff");
        assert_eq!(prefix_from_hex(&hex), Some(gp));
    }

    #[test]
    fn test_prefix_from_hex_invalid() {
        assert!(prefix_from_hex("xyz").is_none());
        assert!(prefix_from_hex("abc").is_none());
        assert!(prefix_from_hex("0102").is_none());
    }

    #[test]
    fn test_guid_display() {
        let guid = Guid::new([0xaa; 12], [0, 0, 1, 0xc2]);
        assert_eq!(guid.to_string(), "aaaaaaaaaaaaaaaaaaaaaaaa|000001c2");
        assert_eq!(&guid.to_bytes()[12..], &[0, 0, 1, 0xc2]);
    }

    #[test]
    fn test_participant_validate() {
        let data = ParticipantData::new([1; 12], ParticipantRole::Client, Duration::from_secs(5));
        assert!(data.validate().is_ok());

        let unset = ParticipantData::new([0; 12], ParticipantRole::Client, Duration::from_secs(5));
        assert!(matches!(
            unset.validate(),
            Err(EngineError::MalformedDescriptor(_))
        ));

        let no_lease = ParticipantData::new([1; 12], ParticipantRole::Client, Duration::ZERO);
        assert!(no_lease.validate().is_err());
    }

    #[test]
    fn test_endpoint_validate() {
        let mut data = EndpointData {
            guid: Guid::new([1; 12], [0, 0, 1, 0x03]),
            topic_name: "sensor/temperature".into(),
            type_name: "Temperature".into(),
            kind: EndpointKind::Writer,
            reliable: true,
            durability: 0,
            unicast_locators: vec![],
        };
        assert!(data.validate().is_ok());

        data.guid.entity_id = ENTITYID_PARTICIPANT;
        assert!(data.validate().is_err());
    }

    #[test]
    fn test_role_is_peer() {
        assert!(ParticipantRole::Server.is_peer());
        assert!(ParticipantRole::Client.is_peer());
        assert!(!ParticipantRole::Simple.is_peer());
    }

    #[test]
    fn test_removal_reason_status() {
        assert_eq!(RemovalReason::Dropped.status(), ParticipantStatus::Dropped);
        assert_eq!(RemovalReason::Disposed.status(), ParticipantStatus::Removed);
    }
}
