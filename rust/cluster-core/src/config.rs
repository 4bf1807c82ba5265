// rust/cluster-core/src/config.rs

//! Configuration management for the cluster master.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, validation of configuration values, and the classic
//! line-oriented cluster roster format.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClusterError, Result};

/// Default port a worker listens on.
pub const DEFAULT_WORKER_PORT: u16 = 1093;

/// Default performance rank of a roster entry.
pub const DEFAULT_PERF: u32 = 100;

// Top-level master configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub session: SessionConfig,
    pub transfer: TransferConfig,
    pub interrupt: InterruptConfig,
    pub connect: ConnectConfig,
    /// Static worker roster.
    pub workers: Vec<WorkerEntry>,
}

/// Position of this process in the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// This process is the master and delegates work to the connected
    /// workers, which may share filesystems and caches with each other.
    #[default]
    Delegating,
    /// This process fronts a remote master. Every request goes straight to
    /// that peer, which fans out to its own workers.
    Direct,
}

// Session-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub role: Role,
    /// Filesystem image of the master itself. Workers sharing it are never
    /// unique.
    pub image: String,
    /// Working directory announced to workers on reset.
    pub work_dir: String,
    /// Directory (relative to the worker's working directory) holding packages.
    pub package_dir: String,
    /// Directories searched for macros named by `.L`/`.x`/`.X` commands.
    pub macro_path: Vec<PathBuf>,
    pub log_level: i32,
    pub log_mask: u32,
    /// Port workers open for bulk transfers.
    pub bulk_port: u16,
}

// Block sizes and framing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Block size (bytes) used when streaming files to workers.
    pub file_block_size: usize,
    /// Block size (bytes) used when draining log chunks.
    pub log_block_size: usize,
    /// Default number of parallel streams for package uploads.
    pub bulk_streams: u32,
    /// Largest accepted message frame in bytes.
    pub max_frame_size: usize,
}

// Bounds on the hard-interrupt drain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    /// Maximum number of polls while waiting for the urgent acknowledgement.
    pub max_wait_iterations: u32,
    /// Delay between two polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Wait used when the urgent byte has not arrived yet, in milliseconds.
    pub idle_wait_ms: u64,
    /// Overall deadline for one worker's drain, in milliseconds.
    pub drain_timeout_ms: u64,
}

// Connection establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Maximum number of retries for a failed connect.
    pub max_retries: u32,
    /// Initial delay (milliseconds) between retries.
    pub retry_delay_ms: u64,
    /// Maximum delay (milliseconds) between retries.
    pub max_retry_delay_ms: u64,
    pub keepalive: bool,
    pub nodelay: bool,
}

/// One worker in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_perf")]
    pub perf: u32,
    /// Filesystem image tag; empty means the host name.
    #[serde(default)]
    pub image: String,
}

fn default_port() -> u16 {
    DEFAULT_WORKER_PORT
}

fn default_perf() -> u32 {
    DEFAULT_PERF
}

impl WorkerEntry {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_WORKER_PORT,
            perf: DEFAULT_PERF,
            image: String::new(),
        }
    }

    /// Image tag with the host-name fallback applied.
    pub fn image_tag(&self) -> &str {
        if self.image.is_empty() {
            &self.host
        } else {
            &self.image
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::Delegating,
            image: String::new(),
            work_dir: "~/pcc".to_string(),
            package_dir: "packages".to_string(),
            macro_path: vec![PathBuf::from(".")],
            log_level: 0,
            log_mask: u32::MAX,
            bulk_port: 1094,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            file_block_size: 32 * 1024,
            log_block_size: 16 * 1024,
            bulk_streams: 1,
            max_frame_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            max_wait_iterations: 100,
            poll_interval_ms: 100,
            idle_wait_ms: 1_000,
            drain_timeout_ms: 30_000,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            max_retries: 3,
            retry_delay_ms: 200,
            max_retry_delay_ms: 5_000,
            keepalive: true,
            nodelay: true,
        }
    }
}

impl InterruptConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl ConnectConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl FromStr for ClusterConfig {
    type Err = ClusterError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ClusterError::config_with_source("failed to parse TOML config", e))
    }
}

impl ClusterConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::io_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    /// Append the entries of a classic roster file and adopt its master image
    /// when none is configured.
    #[must_use]
    pub fn with_roster(mut self, roster: Roster) -> Self {
        if self.session.image.is_empty() {
            if let Some(image) = roster.master_image {
                self.session.image = image;
            }
        }
        self.workers.extend(roster.workers);
        self
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `PCC_` and use underscores
    // to separate nested fields. For example:
    // - `PCC_SESSION_ROLE` overrides `session.role` ("delegating" or "direct")
    // - `PCC_SESSION_WORK_DIR` overrides `session.work_dir`
    // - `PCC_TRANSFER_FILE_BLOCK_SIZE` overrides `transfer.file_block_size`
    // - `PCC_INTERRUPT_DRAIN_TIMEOUT_MS` overrides `interrupt.drain_timeout_ms`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Session overrides
        if let Ok(val) = std::env::var("PCC_SESSION_ROLE") {
            match val.to_lowercase().as_str() {
                "delegating" => self.session.role = Role::Delegating,
                "direct" => self.session.role = Role::Direct,
                _ => {} // ignore invalid values
            }
        }
        if let Ok(val) = std::env::var("PCC_SESSION_IMAGE") {
            self.session.image = val;
        }
        if let Ok(val) = std::env::var("PCC_SESSION_WORK_DIR") {
            self.session.work_dir = val;
        }
        if let Ok(val) = std::env::var("PCC_SESSION_PACKAGE_DIR") {
            self.session.package_dir = val;
        }
        if let Ok(val) = std::env::var("PCC_SESSION_MACRO_PATH") {
            self.session.macro_path = std::env::split_paths(&val).collect();
        }
        if let Ok(val) = std::env::var("PCC_SESSION_LOG_LEVEL") {
            if let Ok(v) = val.parse() {
                self.session.log_level = v;
            }
        }
        if let Ok(val) = std::env::var("PCC_SESSION_BULK_PORT") {
            if let Ok(v) = val.parse() {
                self.session.bulk_port = v;
            }
        }

        // Transfer overrides
        if let Ok(val) = std::env::var("PCC_TRANSFER_FILE_BLOCK_SIZE") {
            if let Ok(v) = val.parse() {
                self.transfer.file_block_size = v;
            }
        }
        if let Ok(val) = std::env::var("PCC_TRANSFER_LOG_BLOCK_SIZE") {
            if let Ok(v) = val.parse() {
                self.transfer.log_block_size = v;
            }
        }
        if let Ok(val) = std::env::var("PCC_TRANSFER_BULK_STREAMS") {
            if let Ok(v) = val.parse() {
                self.transfer.bulk_streams = v;
            }
        }

        // Interrupt overrides
        if let Ok(val) = std::env::var("PCC_INTERRUPT_MAX_WAIT_ITERATIONS") {
            if let Ok(v) = val.parse() {
                self.interrupt.max_wait_iterations = v;
            }
        }
        if let Ok(val) = std::env::var("PCC_INTERRUPT_POLL_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.interrupt.poll_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("PCC_INTERRUPT_DRAIN_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.interrupt.drain_timeout_ms = v;
            }
        }

        // Connect overrides
        if let Ok(val) = std::env::var("PCC_CONNECT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.connect.connect_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("PCC_CONNECT_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.connect.max_retries = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.session.package_dir.is_empty() {
            return Err(ClusterError::config(
                "session.package_dir must not be empty",
            ));
        }

        if self.transfer.file_block_size == 0 {
            return Err(ClusterError::config(
                "transfer.file_block_size must be greater than 0",
            ));
        }
        if self.transfer.log_block_size == 0 {
            return Err(ClusterError::config(
                "transfer.log_block_size must be greater than 0",
            ));
        }
        if self.transfer.bulk_streams == 0 {
            return Err(ClusterError::config(
                "transfer.bulk_streams must be greater than 0",
            ));
        }
        if self.transfer.max_frame_size < self.transfer.file_block_size {
            return Err(ClusterError::config(
                "transfer.max_frame_size must be at least transfer.file_block_size",
            ));
        }

        if self.interrupt.max_wait_iterations == 0 {
            return Err(ClusterError::config(
                "interrupt.max_wait_iterations must be greater than 0",
            ));
        }
        if self.interrupt.drain_timeout_ms == 0 {
            return Err(ClusterError::config(
                "interrupt.drain_timeout_ms must be greater than 0",
            ));
        }

        for entry in &self.workers {
            if entry.host.is_empty() {
                return Err(ClusterError::config("workers.host must not be empty"));
            }
            if entry.port == 0 {
                return Err(ClusterError::config(format!(
                    "workers.port for '{}' must be greater than 0",
                    entry.host
                )));
            }
        }

        Ok(())
    }
}

/// Contents of a classic cluster roster file.
///
/// ```text
/// # comment
/// node   master.example.org image=nfs1
/// worker w1.example.org perf=200 image=nfs1
/// slave  w2.example.org port=2093
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    /// Image declared on a `node`/`master` line.
    pub master_image: Option<String>,
    pub workers: Vec<WorkerEntry>,
}

impl Roster {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::io_with_source(path, "failed to read roster file", e)
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut roster = Self::default();

        for (index, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let mut words = line.split_whitespace();
            let keyword = words.next().unwrap_or("");
            let host = words.next().ok_or_else(|| {
                ClusterError::config(format!("roster line {}: missing host name", index + 1))
            })?;

            let mut entry = WorkerEntry::new(host);
            for option in words {
                let (key, value) = option.split_once('=').ok_or_else(|| {
                    ClusterError::config(format!(
                        "roster line {}: expected key=value, got '{}'",
                        index + 1,
                        option
                    ))
                })?;
                match key {
                    "image" => entry.image = value.to_string(),
                    "perf" => entry.perf = parse_option(index, key, value)?,
                    "port" => entry.port = parse_option(index, key, value)?,
                    // Unknown options are tolerated.
                    _ => {}
                }
            }

            match keyword {
                "node" | "master" => roster.master_image = Some(entry.image_tag().to_string()),
                "worker" | "slave" => roster.workers.push(entry),
                other => {
                    return Err(ClusterError::config(format!(
                        "roster line {}: unknown keyword '{}'",
                        index + 1,
                        other
                    )));
                }
            }
        }

        Ok(roster)
    }
}

fn parse_option<T: FromStr>(index: usize, key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        ClusterError::config(format!(
            "roster line {}: invalid value '{}' for {}",
            index + 1,
            value,
            key
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();

        assert_eq!(config.session.role, Role::Delegating);
        assert_eq!(config.session.package_dir, "packages");
        assert_eq!(config.transfer.file_block_size, 32 * 1024);
        assert_eq!(config.transfer.log_block_size, 16 * 1024);
        assert_eq!(config.interrupt.max_wait_iterations, 100);
        assert_eq!(config.interrupt.poll_interval(), Duration::from_millis(100));
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_default_validates() {
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [session]
            role = "direct"
            image = "nfs1"

            [[workers]]
            host = "w1"
            perf = 250
        "#;
        let config: ClusterConfig = toml.parse().unwrap();

        assert_eq!(config.session.role, Role::Direct);
        assert_eq!(config.session.image, "nfs1");
        // Other session fields should be defaults
        assert_eq!(config.session.package_dir, "packages");
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].perf, 250);
        assert_eq!(config.workers[0].port, DEFAULT_WORKER_PORT);
        assert_eq!(config.workers[0].image_tag(), "w1");
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<ClusterConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [transfer]
            file_block_size = 4096
            "#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.transfer.file_block_size, 4096);
    }

    #[test]
    fn test_from_file_not_found() {
        let result = ClusterConfig::from_file("/nonexistent/pcc.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_block_size() {
        let mut config = ClusterConfig::default();
        config.transfer.file_block_size = 0;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.transfer.log_block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_drain() {
        let mut config = ClusterConfig::default();
        config.interrupt.max_wait_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_worker_entry() {
        let mut config = ClusterConfig::default();
        config.workers.push(WorkerEntry { port: 0, ..WorkerEntry::new("w1") });
        assert!(config.validate().is_err());
    }

    // Helper to clear all PCC_ environment variables for test isolation
    fn clear_pcc_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("PCC_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test since env
    // vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_pcc_env_vars();

        std::env::set_var("PCC_SESSION_ROLE", "direct");
        std::env::set_var("PCC_SESSION_WORK_DIR", "/scratch/pcc");
        std::env::set_var("PCC_TRANSFER_FILE_BLOCK_SIZE", "8192");
        std::env::set_var("PCC_INTERRUPT_DRAIN_TIMEOUT_MS", "500");

        let config = ClusterConfig::default().with_env_overrides();

        assert_eq!(config.session.role, Role::Direct);
        assert_eq!(config.session.work_dir, "/scratch/pcc");
        assert_eq!(config.transfer.file_block_size, 8192);
        assert_eq!(config.interrupt.drain_timeout(), Duration::from_millis(500));

        clear_pcc_env_vars();

        // Invalid values are ignored
        std::env::set_var("PCC_TRANSFER_FILE_BLOCK_SIZE", "lots");
        std::env::set_var("PCC_SESSION_ROLE", "sideways");

        let config = ClusterConfig::default().with_env_overrides();
        assert_eq!(config.transfer.file_block_size, 32 * 1024);
        assert_eq!(config.session.role, Role::Delegating);

        clear_pcc_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = ClusterConfig::default();
        original.workers.push(WorkerEntry::new("w1"));
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: ClusterConfig = toml_str.parse().unwrap();

        assert_eq!(parsed.workers, original.workers);
        assert_eq!(parsed.session.work_dir, original.session.work_dir);
    }

    #[test]
    fn test_roster_parse() {
        let roster = Roster::parse(
            "# cluster\n\
             node master.example.org image=nfs1\n\
             worker w1.example.org perf=200 image=nfs1\n\
             slave w2.example.org port=2093   # second disk\n\
             \n\
             worker w3.example.org\n",
        )
        .unwrap();

        assert_eq!(roster.master_image.as_deref(), Some("nfs1"));
        assert_eq!(roster.workers.len(), 3);
        assert_eq!(roster.workers[0].perf, 200);
        assert_eq!(roster.workers[0].image_tag(), "nfs1");
        assert_eq!(roster.workers[1].port, 2093);
        assert_eq!(roster.workers[1].perf, DEFAULT_PERF);
        assert_eq!(roster.workers[2].image_tag(), "w3.example.org");
    }

    #[test]
    fn test_roster_parse_errors() {
        assert!(Roster::parse("worker\n").is_err());
        assert!(Roster::parse("router r1\n").is_err());
        assert!(Roster::parse("worker w1 perf=fast\n").is_err());
        assert!(Roster::parse("worker w1 perf\n").is_err());
    }

    #[test]
    fn test_with_roster_keeps_configured_image() {
        let roster = Roster::parse("node m image=nfs2\nworker w1\n").unwrap();

        let config = ClusterConfig::default().with_roster(roster.clone());
        assert_eq!(config.session.image, "nfs2");
        assert_eq!(config.workers.len(), 1);

        let mut config = ClusterConfig::default();
        config.session.image = "local".to_string();
        let config = config.with_roster(roster);
        assert_eq!(config.session.image, "local");
    }
}
