//! Runtime configuration and persisted settings.
//!
//! Every timing and sizing knob the protocol depends on lives in
//! [`PairingConfig`] as a named option; nothing is scattered as a literal
//! inside the state machines. [`AppSettings`] is the on-disk counterpart
//! for the CLI (TOML under the user config directory).

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Which fragmentation scheme the credential transfer uses.
///
/// Indexed is the default: self-describing boundaries, tolerant of
/// reordering. Sentinel survives only for compatibility with responders
/// that still speak the naive start/end framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentScheme {
    #[default]
    Indexed,
    Sentinel,
}

/// Tunable parameters of a pairing attempt.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// One-time code length.
    pub code_len: usize,
    /// Best-effort expiry window for a stored code.
    pub code_expiry: Duration,
    /// Max payload bytes per fragment (wire frame is 2 bytes longer).
    pub max_chunk: usize,
    /// Fixed delay after connect before the first read/write. Empirically
    /// needed on some platform stacks; disable via `settle_after_connect`.
    pub settle_delay: Duration,
    pub settle_after_connect: bool,
    /// Polling fallback: read interval and attempt budget.
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    /// How long a subscription waits for one notification before the
    /// attempt is reported as timed out.
    pub notify_wait: Duration,
    /// How long the human-confirmation hook may take.
    pub confirmation_timeout: Duration,
    /// Pacing delay between consecutive fragment writes.
    pub inter_fragment_delay: Duration,
    /// Wall-clock budget for device discovery.
    pub scan_timeout: Duration,
    /// Name broadcast while advertising.
    pub device_name: String,
    pub fragment_scheme: FragmentScheme,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_len: crate::codec::CODE_LEN,
            code_expiry: Duration::from_secs(300),
            max_chunk: crate::codec::DEFAULT_MAX_CHUNK,
            settle_delay: Duration::from_millis(2500),
            settle_after_connect: true,
            poll_interval: Duration::from_millis(500),
            poll_attempts: 40,
            notify_wait: Duration::from_secs(20),
            confirmation_timeout: Duration::from_secs(30),
            inter_fragment_delay: Duration::from_millis(50),
            scan_timeout: Duration::from_secs(10),
            device_name: default_device_name(),
            fragment_scheme: FragmentScheme::Indexed,
        }
    }
}

/// Persisted CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Name shown in the BLE advertisement.
    pub device_name: String,
    /// Prefix of the generated device identity (`TAB`, `MOB` or `DEV`).
    pub identity_prefix: String,
    /// Accept pairing codes without asking.
    pub auto_confirm: bool,
    pub verbose: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            identity_prefix: "DEV".to_string(),
            auto_confirm: false,
            verbose: false,
        }
    }
}

impl AppSettings {
    fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blepair");
        config_dir.join("settings.toml")
    }

    /// Load settings, falling back to defaults if the file is missing or
    /// unparsable.
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {path:?}");
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {e}, using defaults");
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {e}, using defaults");
                }
            }
        }
        Self::default()
    }

    /// Save settings, creating the config directory if needed.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {path:?}");
        Ok(())
    }
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "blepair".to_string())
}
