//! Engine configuration and the persisted user settings behind it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::{GhostCapabilities, MIN_CHUNK};
use crate::transport::GattConfig;

const DEFAULT_CONTROL_TIMEOUT_SECS: u64 = 15;
const SETTINGS_FILE: &str = "settings.json";

fn default_display_name() -> String {
    "GhostDrop".to_string()
}

fn default_true() -> bool {
    true
}

/// User-tunable settings persisted as JSON, the knobs an embedding app
/// surfaces. Everything else derives from these plus defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_true")]
    pub prefer_l2cap: bool,
    #[serde(default)]
    pub capabilities: GhostCapabilities,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            prefer_l2cap: true,
            capabilities: GhostCapabilities::default(),
        }
    }
}

impl RuntimeSettings {
    fn normalised(mut self) -> Self {
        if self.display_name.trim().is_empty() {
            self.display_name = default_display_name();
        }
        self.capabilities = self.capabilities.normalised();
        self
    }
}

/// Everything the session engine needs to run, with the timer values the
/// protocol fixes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub capabilities: GhostCapabilities,
    /// Waiting for the peer's `HelloAck`.
    pub hello_timeout: Duration,
    /// Waiting for the peer's `VerifyAck`.
    pub verify_timeout: Duration,
    /// Waiting for the receiver's `Resume` reply after `Metadata`.
    pub resume_timeout: Duration,
    pub gatt: GattConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capabilities: GhostCapabilities::default(),
            hello_timeout: Duration::from_secs(DEFAULT_CONTROL_TIMEOUT_SECS),
            verify_timeout: Duration::from_secs(DEFAULT_CONTROL_TIMEOUT_SECS),
            resume_timeout: Duration::from_secs(DEFAULT_CONTROL_TIMEOUT_SECS),
            gatt: GattConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            capabilities: settings.capabilities.normalised(),
            ..Self::default()
        }
    }

    pub fn normalised(mut self) -> Self {
        self.capabilities = self.capabilities.normalised();
        self.gatt.window_size = self.gatt.window_size.max(1);
        self
    }

    /// Chunk size actually used for a transfer: the caller's request
    /// clamped to the local maximum.
    pub fn clamp_chunk_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.capabilities.max_chunk)
            .min(self.capabilities.max_chunk)
            .max(MIN_CHUNK)
    }
}

/// Well-known state directories under the app data root.
pub fn resume_dir(app_data: &Path) -> PathBuf {
    app_data.join("GhostDrop").join("Resume")
}

pub fn incoming_dir(app_data: &Path) -> PathBuf {
    app_data.join("GhostDrop").join("Incoming")
}

/// JSON-backed settings persistence.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to prepare config dir at {}", base_dir.display()))?;
        Ok(Self {
            path: base_dir.join(SETTINGS_FILE),
        })
    }

    /// Load the persisted settings, falling back to defaults when the file
    /// is missing.
    pub fn load(&self) -> Result<RuntimeSettings> {
        if !self.path.exists() {
            return Ok(RuntimeSettings::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read settings {}", self.path.display()))?;
        let settings: RuntimeSettings = serde_json::from_str(&contents)
            .with_context(|| format!("invalid settings {}", self.path.display()))?;
        Ok(settings.normalised())
    }

    pub fn save(&self, settings: &RuntimeSettings) -> Result<()> {
        let normalised = settings.clone().normalised();
        let payload =
            serde_json::to_vec_pretty(&normalised).context("failed to serialise settings")?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("failed to persist settings {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_clamps_to_local_maximum() {
        let config = EngineConfig::default();
        let max = config.capabilities.max_chunk;
        assert_eq!(config.clamp_chunk_size(None), max);
        assert_eq!(config.clamp_chunk_size(Some(max * 2)), max);
        assert_eq!(config.clamp_chunk_size(Some(128)), 128);
        assert_eq!(config.clamp_chunk_size(Some(1)), MIN_CHUNK);
    }

    #[test]
    fn settings_roundtrip_through_store() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = ConfigStore::with_base_dir(temp.path().to_path_buf()).expect("store");

        // Missing file → defaults
        let defaults = store.load().expect("load defaults");
        assert!(defaults.prefer_l2cap);

        let mut settings = RuntimeSettings::default();
        settings.display_name = "Test Rig".into();
        settings.capabilities.max_chunk = 10; // below floor, normalised on load
        store.save(&settings).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.display_name, "Test Rig");
        assert_eq!(loaded.capabilities.max_chunk, MIN_CHUNK);
    }

    #[test]
    fn blank_display_name_restored_to_default() {
        let settings = RuntimeSettings {
            display_name: "   ".into(),
            ..RuntimeSettings::default()
        }
        .normalised();
        assert_eq!(settings.display_name, "GhostDrop");
    }

    #[test]
    fn state_dirs_are_namespaced() {
        let base = Path::new("/tmp/appdata");
        assert!(resume_dir(base).ends_with("GhostDrop/Resume"));
        assert!(incoming_dir(base).ends_with("GhostDrop/Incoming"));
    }
}
