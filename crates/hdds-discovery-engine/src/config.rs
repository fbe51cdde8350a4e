// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery Server configuration.

use crate::controller::EngineSettings;
use crate::types::{
    prefix_from_hex, GuidPrefix, ParticipantData, ParticipantRole, VENDOR_ID_HDDS,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Discovery Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Fixed GUID prefix (24 hex chars). Derived at startup when absent.
    #[serde(default)]
    pub guid_prefix: Option<String>,

    /// Participant name announced to peers
    #[serde(default = "default_name")]
    pub name: String,

    /// Domain ID served
    #[serde(default)]
    pub domain_id: u32,

    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 11811)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Lease announced for the local participant, in seconds
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,

    /// Local re-announcement cadence
    #[serde(default = "default_announcement_period")]
    pub announcement_period_ms: u64,

    /// Sync scheduler tick
    #[serde(default = "default_sync_period")]
    pub sync_period_ms: u64,

    /// How long a removed record must stay stable before it is trimmed
    #[serde(default = "default_trim_grace")]
    pub trim_grace_ms: u64,

    /// An early wake-up is skipped when the next tick is closer than this
    #[serde(default = "default_wakeup_imminence")]
    pub wakeup_imminence_ms: u64,

    /// Maximum number of known participants
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// Maximum number of endpoints per participant
    #[serde(default = "default_max_endpoints")]
    pub max_endpoints_per_participant: usize,

    /// Maximum message size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Peer servers this server connects to
    #[serde(default)]
    pub remote_servers: Vec<RemoteServer>,

    /// Delay between connection attempts to a remote server
    #[serde(default = "default_connect_retry")]
    pub connect_retry_ms: u64,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// A peer server to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServer {
    pub guid_prefix: String,
    pub address: SocketAddr,
}

impl RemoteServer {
    /// Parse the `<prefix>@<host:port>` command-line form.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (prefix, address) = s.split_once('@').ok_or_else(|| {
            ConfigError::InvalidValue(format!("remote server '{}' is not prefix@address", s))
        })?;
        let remote = Self {
            guid_prefix: prefix.to_string(),
            address: address.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("invalid remote server address '{}'", address))
            })?,
        };
        remote.prefix()?;
        Ok(remote)
    }

    pub fn prefix(&self) -> Result<GuidPrefix, ConfigError> {
        prefix_from_hex(&self.guid_prefix).ok_or_else(|| {
            ConfigError::InvalidValue(format!("invalid GUID prefix '{}'", self.guid_prefix))
        })
    }
}

/// Durable state location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_name() -> String {
    "hdds-discovery-server".into()
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    11811
}

fn default_lease_duration() -> u64 {
    20
}

fn default_announcement_period() -> u64 {
    3000
}

fn default_sync_period() -> u64 {
    450
}

fn default_trim_grace() -> u64 {
    2000
}

fn default_wakeup_imminence() -> u64 {
    10
}

fn default_max_participants() -> usize {
    1000
}

fn default_max_endpoints() -> usize {
    10000
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_connect_retry() -> u64 {
    2000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            guid_prefix: None,
            name: default_name(),
            domain_id: 0,
            bind_address: default_bind_address(),
            port: default_port(),
            lease_duration_secs: default_lease_duration(),
            announcement_period_ms: default_announcement_period(),
            sync_period_ms: default_sync_period(),
            trim_grace_ms: default_trim_grace(),
            wakeup_imminence_ms: default_wakeup_imminence(),
            max_participants: default_max_participants(),
            max_endpoints_per_participant: default_max_endpoints(),
            max_message_size: default_max_message_size(),
            remote_servers: Vec::new(),
            connect_retry_ms: default_connect_retry(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Configured GUID prefix, or one derived from the process id and clock.
    pub fn guid_prefix(&self) -> Result<GuidPrefix, ConfigError> {
        match &self.guid_prefix {
            Some(hex) => prefix_from_hex(hex)
                .ok_or_else(|| ConfigError::InvalidValue(format!("invalid GUID prefix '{}'", hex))),
            None => Ok(derive_guid_prefix()),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync_period_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Engine tuning derived from this configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            announcement_period: Duration::from_millis(self.announcement_period_ms),
            sync_period: self.sync_period(),
            trim_grace: Duration::from_millis(self.trim_grace_ms),
            wakeup_imminence: Duration::from_millis(self.wakeup_imminence_ms),
            max_participants: self.max_participants,
            max_endpoints_per_participant: self.max_endpoints_per_participant,
        }
    }

    /// Descriptor of the local server participant.
    pub fn local_participant(&self, prefix: GuidPrefix) -> ParticipantData {
        let mut data = ParticipantData::new(prefix, ParticipantRole::Server, self.lease_duration());
        data.domain_id = self.domain_id;
        data.name = Some(self.name.clone());
        if !self.bind_address.is_unspecified() {
            data.metatraffic_locators.push(self.listen_address());
        }
        data
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.lease_duration_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "lease_duration_secs cannot be 0".into(),
            ));
        }
        if self.sync_period_ms == 0 {
            return Err(ConfigError::InvalidValue("sync_period_ms cannot be 0".into()));
        }
        if self.max_participants == 0 {
            return Err(ConfigError::InvalidValue(
                "max_participants cannot be 0".into(),
            ));
        }
        if self.max_message_size < 1024 {
            return Err(ConfigError::InvalidValue(
                "max_message_size must be at least 1024".into(),
            ));
        }
        self.guid_prefix()?;
        for remote in &self.remote_servers {
            remote.prefix()?;
        }
        if self.persistence.enabled {
            // A derived prefix changes every run and would never find its own file
            if self.guid_prefix.is_none() {
                return Err(ConfigError::InvalidValue(
                    "persistence requires a fixed guid_prefix".into(),
                ));
            }
            if self.persistence.directory.is_none() {
                return Err(ConfigError::InvalidValue(
                    "persistence.directory required when persistence enabled".into(),
                ));
            }
        }
        Ok(())
    }
}

fn derive_guid_prefix() -> GuidPrefix {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut prefix = [0u8; 12];
    prefix[..2].copy_from_slice(&VENDOR_ID_HDDS);
    prefix[2..6].copy_from_slice(&std::process::id().to_be_bytes());
    prefix[6..].copy_from_slice(&nanos.to_be_bytes()[2..]);
    prefix
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
