use crate::{
    amplifier::{ConfigUpdate, TriggerPolicy},
    error::ConfigError,
};
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, time::Duration};

pub const DEFAULT_SETTINGS_PATH: &str = "config/amplifier.json";

const DEFAULT_RETIRE_GRACE_MS: u64 = 60_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmplifierSettings {
    /// Label attached to every log line of this amplifier instance.
    pub service: String,
    pub burst: ConfigUpdate,
    pub policy: TriggerPolicy,
    pub retire_grace_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for AmplifierSettings {
    fn default() -> Self {
        Self {
            service: "amplifier".to_string(),
            burst: ConfigUpdate::default(),
            policy: TriggerPolicy::default(),
            retire_grace_ms: DEFAULT_RETIRE_GRACE_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl AmplifierSettings {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_buf = path_ref.to_path_buf();
        let file = File::open(path_ref).map_err(|source| ConfigError::Open {
            path: path_buf.clone(),
            source,
        })?;
        serde_json::from_reader(file).map_err(|source| ConfigError::Deserialize {
            path: path_buf,
            source,
        })
    }

    pub fn retire_grace(&self) -> Duration {
        Duration::from_millis(self.retire_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

pub fn load_default_settings() -> Result<AmplifierSettings, ConfigError> {
    AmplifierSettings::load_from_path(DEFAULT_SETTINGS_PATH)
}
