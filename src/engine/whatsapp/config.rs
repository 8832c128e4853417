// WhatsApp Connection Manager — Configuration
// ConnectionConfig, load/save via the engine_config table, TOML file loading

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ClientProfile, ProtocolVersion};
use crate::engine::paths;
use crate::engine::sessions::SessionStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Config Struct ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Root directory for per-attempt Working Areas.
    pub sessions_root: PathBuf,
    /// Closes past this many scheduled retries always end in GIVE_UP.
    pub max_retry_attempts: u32,
    pub simple_backoff_base_ms: u64,
    pub simple_backoff_cap_ms: u64,
    pub different_approach_backoff_base_ms: u64,
    pub different_approach_backoff_cap_ms: u64,
    /// Delay between teardown and re-init on a manual reset.
    pub reset_delay_ms: u64,
    /// How long the QR fallback poll inspects the transport for a payload.
    pub qr_poll_window_secs: u64,
    pub qr_poll_interval_ms: u64,
    pub qr_min_dimension: u32,
    pub protocol_version: [u32; 3],
    /// Client fingerprints, rotated on RETRY_DIFFERENT_APPROACH.
    pub profiles: Vec<ClientProfile>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            sessions_root: paths::sessions_root(),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            simple_backoff_base_ms: SIMPLE_BACKOFF_BASE_MS,
            simple_backoff_cap_ms: SIMPLE_BACKOFF_CAP_MS,
            different_approach_backoff_base_ms: DIFFERENT_APPROACH_BACKOFF_BASE_MS,
            different_approach_backoff_cap_ms: DIFFERENT_APPROACH_BACKOFF_CAP_MS,
            reset_delay_ms: RESET_DELAY_MS,
            qr_poll_window_secs: QR_FALLBACK_WINDOW_SECS,
            qr_poll_interval_ms: QR_FALLBACK_POLL_INTERVAL_MS,
            qr_min_dimension: QR_MIN_DIMENSION,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            profiles: default_profiles(),
        }
    }
}

/// Desktop-browser fingerprints the multi-device protocol accepts.
pub fn default_profiles() -> Vec<ClientProfile> {
    vec![
        ClientProfile::new("Chrome", "Ubuntu", "22.04.4"),
        ClientProfile::new("Safari", "Mac OS", "14.4.1"),
        ClientProfile::new("Edge", "Windows", "10.0.22631"),
        ClientProfile::new("Firefox", "Ubuntu", "24.04"),
        ClientProfile::new("Chrome", "Mac OS", "14.4.1"),
    ]
}

impl ConnectionConfig {
    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion(self.protocol_version)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn qr_poll_window(&self) -> Duration {
        Duration::from_secs(self.qr_poll_window_secs)
    }

    pub fn qr_poll_interval(&self) -> Duration {
        Duration::from_millis(self.qr_poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.profiles.is_empty() {
            return Err(EngineError::Config("At least one client profile is required".into()));
        }
        let pairs = [
            ("simple", self.simple_backoff_base_ms, self.simple_backoff_cap_ms),
            (
                "different_approach",
                self.different_approach_backoff_base_ms,
                self.different_approach_backoff_cap_ms,
            ),
        ];
        for (name, base, cap) in pairs {
            if cap == 0 {
                return Err(EngineError::Config(format!("{}_backoff_cap_ms must be non-zero", name)));
            }
            if cap < base {
                return Err(EngineError::Config(format!(
                    "{}_backoff_cap_ms ({}) is below its base ({})",
                    name, cap, base
                )));
            }
        }
        Ok(())
    }

    /// Parse from TOML text; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: ConnectionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, or defaults if the file does not exist.
    pub fn from_toml_file(path: &Path) -> EngineResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Config Persistence ─────────────────────────────────────────────────

pub fn load_config(store: &SessionStore) -> EngineResult<ConnectionConfig> {
    match store.get_config(CONFIG_KEY)? {
        Some(json) => {
            let config: ConnectionConfig = serde_json::from_str(&json)
                .map_err(|e| EngineError::Config(format!("Parse {} config: {}", CONFIG_KEY, e)))?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(ConnectionConfig::default()),
    }
}

pub fn save_config(store: &SessionStore, config: &ConnectionConfig) -> EngineResult<()> {
    config.validate()?;
    let json = serde_json::to_string(config)?;
    store.set_config(CONFIG_KEY, &json)
}
