// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Discovery Server
//!
//! Central discovery server for DDS environments where multicast is unavailable:
//! - Cloud/Kubernetes deployments
//! - Corporate networks with multicast disabled
//! - WAN deployments with several cooperating servers
//!
//! # Usage
//!
//! ```bash
//! # Start server on default port (11811)
//! hdds-discovery-engine
//!
//! # Fixed identity with persistence
//! hdds-discovery-engine --guid-prefix 4453005f7c13000000000001 --persistence-dir /var/lib/hdds
//!
//! # Connect to a peer server
//! hdds-discovery-engine --remote 4453005f7c13000000000002@10.0.0.2:11811
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use hdds_discovery_engine::{
    types::prefix_to_hex, DiscoveryService, LoggingHost, RemoteServer, ServerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HDDS Discovery Server - centralized discovery database for DDS
#[derive(Parser, Debug)]
#[command(name = "hdds-discovery-engine")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<String>,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fixed GUID prefix (24 hex chars)
    #[arg(long)]
    guid_prefix: Option<String>,

    /// Remote server to connect to, as <guid-prefix>@<host:port> (repeatable)
    #[arg(long = "remote")]
    remotes: Vec<String>,

    /// Directory for the persistence database (enables persistence)
    #[arg(long)]
    persistence_dir: Option<PathBuf>,

    /// Lease duration announced for this server, in seconds
    #[arg(long)]
    lease_duration: Option<u64>,

    /// Domain ID to serve
    #[arg(short, long)]
    domain: Option<u32>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading config from {:?}", path);
                ServerConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?
            }
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = &self.bind {
            config.bind_address = bind
                .parse()
                .with_context(|| format!("invalid bind address '{}'", bind))?;
        }
        if let Some(prefix) = self.guid_prefix {
            config.guid_prefix = Some(prefix);
        }
        for remote in &self.remotes {
            config.remote_servers.push(RemoteServer::parse(remote)?);
        }
        if let Some(dir) = self.persistence_dir {
            config.persistence.enabled = true;
            config.persistence.directory = Some(dir);
        }
        if let Some(lease) = self.lease_duration {
            config.lease_duration_secs = lease;
        }
        if let Some(domain) = self.domain {
            config.domain_id = domain;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let mut config = args.into_config()?;
    config.validate()?;
    // Pin a derived prefix so the banner and the service agree
    let prefix = config.guid_prefix()?;
    config.guid_prefix = Some(prefix_to_hex(&prefix));

    info!("+----------------------------------------------------+");
    info!(
        "|       HDDS Discovery Server v{}              |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:    {:39} |", config.listen_address());
    info!("|  Prefix:  {:39} |", prefix_to_hex(&prefix));
    info!("|  Domain:  {:39} |", config.domain_id);
    info!("|  Remotes: {:39} |", config.remote_servers.len());
    info!(
        "|  Persist: {:39} |",
        if config.persistence.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    info!(
        "|  Lease:   {:39} |",
        format!("{}s", config.lease_duration_secs)
    );
    info!("+----------------------------------------------------+");

    let service = DiscoveryService::new(config, Arc::new(LoggingHost))?;

    let handle = service.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        handle.shutdown();
    });

    service.run().await?;
    Ok(())
}
