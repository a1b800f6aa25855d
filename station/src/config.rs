//! Runtime tunables for the session core, loadable from a TOML file.
//! Every timer and bound in the core reads from here; the defaults are
//! the documented production values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_keepalive_secs() -> u64 {
    15
}
fn default_missed_probe_limit() -> u32 {
    3
}
fn default_idle_deadline_secs() -> u64 {
    30 * 60
}
fn default_acquire_timeout_secs() -> u64 {
    30
}
fn default_channel_open_timeout_secs() -> u64 {
    10
}
fn default_sftp_op_timeout_secs() -> u64 {
    60
}
fn default_forward_idle_secs() -> u64 {
    300
}
fn default_frame_cap() -> usize {
    1024 * 1024
}
fn default_transfer_concurrency() -> usize {
    3
}
fn default_progress_interval_ms() -> u64 {
    100
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_backoff_ms() -> u64 {
    500
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_scrollback_bytes() -> usize {
    1024 * 1024
}
fn default_profiler_interval_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_missed_probe_limit")]
    pub missed_probe_limit: u32,
    #[serde(default = "default_idle_deadline_secs")]
    pub idle_deadline_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_channel_open_timeout_secs")]
    pub channel_open_timeout_secs: u64,
    #[serde(default = "default_sftp_op_timeout_secs")]
    pub sftp_op_timeout_secs: u64,
    #[serde(default = "default_forward_idle_secs")]
    pub forward_idle_secs: u64,
    #[serde(default = "default_frame_cap")]
    pub frame_payload_cap: usize,
    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,
    /// Global byte-rate cap for transfers; 0 disables the cap.
    #[serde(default)]
    pub transfer_rate_cap: u32,
    #[serde(default = "default_progress_interval_ms")]
    pub transfer_progress_interval_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub link_down_debounce_ms: u64,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    #[serde(default = "default_profiler_interval_secs")]
    pub profiler_interval_secs: u64,
    /// Trust-on-first-use: record unknown host keys without asking.
    #[serde(default = "default_true")]
    pub auto_accept_new_hosts: bool,
    /// Where the node store, group store, known_hosts and vault live.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize via defaults")
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
    pub fn idle_deadline(&self) -> Duration {
        Duration::from_secs(self.idle_deadline_secs)
    }
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_open_timeout_secs)
    }
    pub fn sftp_op_timeout(&self) -> Duration {
        Duration::from_secs(self.sftp_op_timeout_secs)
    }
    pub fn forward_idle(&self) -> Duration {
        Duration::from_secs(self.forward_idle_secs)
    }
    pub fn transfer_progress_interval(&self) -> Duration {
        Duration::from_millis(self.transfer_progress_interval_ms)
    }
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
    pub fn link_down_debounce(&self) -> Duration {
        Duration::from_millis(self.link_down_debounce_ms)
    }
    pub fn profiler_interval(&self) -> Duration {
        Duration::from_secs(self.profiler_interval_secs)
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs_fallback(),
        }
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".causeway")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.keepalive_interval_secs, 15);
        assert_eq!(config.missed_probe_limit, 3);
        assert_eq!(config.idle_deadline_secs, 1800);
        assert_eq!(config.acquire_timeout_secs, 30);
        assert_eq!(config.channel_open_timeout_secs, 10);
        assert_eq!(config.forward_idle_secs, 300);
        assert_eq!(config.frame_payload_cap, 1024 * 1024);
        assert_eq!(config.transfer_concurrency, 3);
        assert_eq!(config.link_down_debounce_ms, 500);
        assert_eq!(config.reconnect_attempts, 3);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let config: CoreConfig =
            toml::from_str("keepalive_interval_secs = 5\ntransfer_rate_cap = 1048576").unwrap();
        assert_eq!(config.keepalive_interval_secs, 5);
        assert_eq!(config.transfer_rate_cap, 1048576);
        assert_eq!(config.missed_probe_limit, 3);
    }
}
