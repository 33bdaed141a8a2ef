use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::state::Sender;

pub const CONFIG_FILE_NAME: &str = "murmur_config.json";

const DEFAULT_BOOTSTRAP_LIMIT: u32 = 50;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MATCH_WINDOW_MS: i64 = 5_000;
const DEFAULT_RESUBSCRIBE_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bootstrap_limit: Option<u32>,
    pub request_timeout_ms: Option<u64>,
    /// How far apart a pushed record's timestamp may be from a local send and still be
    /// taken for the same message when the service did not echo our client id.
    pub match_window_ms: Option<i64>,
    pub resubscribe_delay_ms: Option<u64>,
    pub local_sender: Option<String>,
    pub owner: Option<String>,
}

pub fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "ignoring unreadable config");
            AppConfig::default()
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

impl AppConfig {
    pub fn bootstrap_limit(&self) -> u32 {
        env_u64("MURMUR_BOOTSTRAP_LIMIT")
            .map(|v| v as u32)
            .or(self.bootstrap_limit)
            .unwrap_or(DEFAULT_BOOTSTRAP_LIMIT)
    }

    pub fn request_timeout(&self) -> Duration {
        let ms = env_u64("MURMUR_REQUEST_TIMEOUT_MS")
            .or(self.request_timeout_ms)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        Duration::from_millis(ms.max(1))
    }

    pub fn match_window_ms(&self) -> i64 {
        self.match_window_ms
            .unwrap_or(DEFAULT_MATCH_WINDOW_MS)
            .max(0)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(
            self.resubscribe_delay_ms
                .unwrap_or(DEFAULT_RESUBSCRIBE_DELAY_MS),
        )
    }

    pub fn local_sender(&self) -> Sender {
        self.local_sender
            .as_deref()
            .map(Sender::from)
            .unwrap_or(Sender::User)
    }
}
