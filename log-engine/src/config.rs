// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration model.
//!
//! A JSON file stands in for the full configuration grammar (which lives
//! outside the core): sources, destinations, queue shapes and the
//! control socket. A reload that fails validation never replaces the
//! running configuration.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration syntax: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_workers() -> usize {
    4
}

fn default_mark_interval() -> u64 {
    1200
}

fn default_capacity() -> usize {
    10_000
}

fn default_disk_max() -> u64 {
    128 * 1024 * 1024
}

fn default_sync_freq() -> u32 {
    64
}

fn default_front_cache() -> usize {
    1000
}

fn default_window() -> usize {
    1000
}

fn default_template() -> String {
    "$ISODATE $HOST $MSGHDR$MESSAGE\n".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceTransport {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct SourceConfig {
    pub id: String,
    /// Listen address, e.g. `127.0.0.1:6514`.
    pub listen: String,
    #[serde(default)]
    pub transport: SourceTransport,
    #[serde(default)]
    pub tls: Option<TlsFiles>,
    /// Strip a HAProxy PROXY protocol preamble.
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Ask destinations for back-pressure instead of dropping.
    #[serde(default)]
    pub flow_control: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DestinationTarget {
    /// Forward over TCP, newline framed.
    Tcp { address: String },
    /// Append rendered records to a file.
    File { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Memory,
    Disk,
    DiskReliable,
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct QueueConfig {
    #[serde(default)]
    pub kind: QueueKind,
    /// Entries for memory queues and memory tiers.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_disk_max")]
    pub disk_max_bytes: u64,
    #[serde(default = "default_sync_freq")]
    pub sync_freq: u32,
    #[serde(default = "default_front_cache")]
    pub front_cache_size: usize,
    #[serde(default = "default_window")]
    pub window_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            kind: QueueKind::Memory,
            capacity: default_capacity(),
            disk_max_bytes: default_disk_max(),
            sync_freq: default_sync_freq(),
            front_cache_size: default_front_cache(),
            window_size: default_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct DestinationConfig {
    pub id: String,
    #[serde(flatten)]
    pub target: DestinationTarget,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queue files and other state live here.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
    #[serde(default = "default_mark_interval")]
    pub mark_interval_secs: u64,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

impl EngineConfig {
    /// Parse without validating; callers may still apply overrides.
    pub fn parse_file(path: &Path) -> Result<EngineConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn load(path: &Path) -> Result<EngineConfig, ConfigError> {
        let config = EngineConfig::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        let mut ids = HashSet::new();
        for source in &self.sources {
            if !ids.insert(format!("src/{}", source.id)) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id {:?}",
                    source.id
                )));
            }
            source
                .listen
                .parse::<std::net::SocketAddr>()
                .map_err(|_| {
                    ConfigError::Invalid(format!(
                        "source {:?}: invalid listen address {:?}",
                        source.id, source.listen
                    ))
                })?;
            if source.transport == SourceTransport::Udp && source.tls.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "source {:?}: TLS is not available over datagrams",
                    source.id
                )));
            }
        }
        for dest in &self.destinations {
            if !ids.insert(format!("dst/{}", dest.id)) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate destination id {:?}",
                    dest.id
                )));
            }
            if let DestinationTarget::Tcp { address } = &dest.target {
                address.parse::<std::net::SocketAddr>().map_err(|_| {
                    ConfigError::Invalid(format!(
                        "destination {:?}: invalid address {:?}",
                        dest.id, address
                    ))
                })?;
            }
            // reject templates that cannot compile at load time
            log_pipeline::Template::compile(&dest.template).map_err(|err| {
                ConfigError::Invalid(format!("destination {:?}: {err}", dest.id))
            })?;
            if dest.queue.kind != QueueKind::Memory && self.persist_dir.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "destination {:?} uses a disk queue but persist_dir is unset",
                    dest.id
                )));
            }
        }
        Ok(())
    }

    /// Stable identifier of this configuration's content.
    pub fn config_id(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Path of one destination's queue file.
    pub fn queue_file(&self, dest: &DestinationConfig) -> Option<PathBuf> {
        let dir = self.persist_dir.as_ref()?;
        let suffix = match dest.queue.kind {
            QueueKind::Memory => return None,
            QueueKind::Disk => "slqf",
            QueueKind::DiskReliable => "slqr",
        };
        Some(dir.join(format!("{}.{}", dest.id, suffix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> EngineConfig {
        serde_json::from_value(serde_json::json!({
            "sources": [
                {"id": "net", "listen": "127.0.0.1:6514", "flow_control": true}
            ],
            "destinations": [
                {"id": "archive", "type": "file", "path": "/tmp/archive.log"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn defaults_are_filled_in() {
        let config = minimal();
        assert_eq!(config.workers, 4);
        assert_eq!(config.mark_interval_secs, 1200);
        assert_eq!(config.destinations[0].queue.kind, QueueKind::Memory);
        assert!(config.destinations[0].template.contains("$ISODATE"));
        config.validate().unwrap();
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut config = minimal();
        config.destinations.push(config.destinations[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_listen_address_rejected() {
        let mut config = minimal();
        config.sources[0].listen = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn disk_queue_requires_persist_dir() {
        let mut config = minimal();
        config.destinations[0].queue.kind = QueueKind::Disk;
        assert!(config.validate().is_err());
        config.persist_dir = Some("/tmp".into());
        config.validate().unwrap();
    }

    #[test]
    fn bad_template_rejected() {
        let mut config = minimal();
        config.destinations[0].template = "${UNTERMINATED".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_id_tracks_content() {
        let a = minimal();
        let mut b = minimal();
        assert_eq!(a.config_id(), b.config_id());
        b.mark_interval_secs = 60;
        assert_ne!(a.config_id(), b.config_id());
    }
}
