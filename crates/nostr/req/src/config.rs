//! nostr-req configuration

use anyhow::Context;
use nostr_client::{PaginationConfig, RelayConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings read from `config.toml`. Command-line flags take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReqConfig {
    /// Seconds allowed for opening each relay connection
    pub connect_timeout_secs: u64,
    /// Seconds to wait for an AUTH challenge with `--force-pre-auth`
    pub pre_auth_wait_secs: u64,
    /// Seconds a relay has to acknowledge an AUTH event
    pub auth_timeout_secs: u64,
    /// Seconds to wait for each remote signer response
    pub bunker_timeout_secs: u64,
    /// Subscription id shown when printing a filter as a REQ envelope
    pub subscription_id: String,
    /// Paginate only once when the filter has an explicit `limit: 0`
    pub stop_on_explicit_zero_limit: bool,
}

impl Default for ReqConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            pre_auth_wait_secs: 5,
            auth_timeout_secs: 10,
            bunker_timeout_secs: 60,
            subscription_id: "nak".to_string(),
            stop_on_explicit_zero_limit: true,
        }
    }
}

impl ReqConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// `<config dir>/nostr-req/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nostr-req").join("config.toml"))
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            pre_auth_wait: Duration::from_secs(self.pre_auth_wait_secs),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
        }
    }

    pub fn bunker_timeout(&self) -> Duration {
        Duration::from_secs(self.bunker_timeout_secs)
    }

    pub fn pagination_config(&self, interval: Duration, global_limit: Option<u64>) -> PaginationConfig {
        PaginationConfig {
            interval,
            global_limit,
            stop_on_explicit_zero_limit: self.stop_on_explicit_zero_limit,
        }
    }
}
