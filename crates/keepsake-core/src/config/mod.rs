//! Sync configuration accepted from the host application.
//!
//! Settings are read from a JSON file, then overridden by `KEEPSAKE_*`
//! environment variables, then validated. Durations are stored as whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "KEEPSAKE_";

/// Tunables for the sync engine and scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct SyncSettings {
    /// Base URL of the remote sync API; sync is disabled when unset
    pub api_base_url: Option<String>,
    /// Periodic sync interval while foregrounded and online
    #[serde(with = "duration_secs")]
    pub auto_sync_interval: Duration,
    /// Base delay of the retry backoff
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    /// Cap on a single backoff delay
    #[serde(with = "duration_secs")]
    pub max_retry_delay: Duration,
    /// Automatic retry attempts after a failed cycle
    pub max_retries: u32,
    /// Delivery attempts before an outbox entry is dropped
    pub max_entry_retries: u32,
    /// Outbox entries read per push batch
    pub batch_size: usize,
    /// Timeout of every remote call
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Delay between connectivity restore and the triggered sync
    #[serde(with = "duration_secs")]
    pub network_settle_delay: Duration,
    /// Age after which a foreground sync runs in full mode
    #[serde(with = "duration_secs")]
    pub full_sync_freshness: Duration,
    pub sync_on_foreground: bool,
    pub sync_on_network_restore: bool,
    pub auto_sync_enabled: bool,
    pub backoff_jitter: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: None,
            auto_sync_interval: Duration::from_secs(5 * 60),
            retry_interval: Duration::from_secs(30),
            max_retry_delay: Duration::from_secs(15 * 60),
            max_retries: 5,
            max_entry_retries: 5,
            batch_size: 10,
            request_timeout: Duration::from_secs(30),
            network_settle_delay: Duration::from_secs(2),
            full_sync_freshness: Duration::from_secs(24 * 60 * 60),
            sync_on_foreground: true,
            sync_on_network_restore: true,
            auto_sync_enabled: true,
            backoff_jitter: true,
        }
    }
}

impl SyncSettings {
    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse settings from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|error| Error::Config(format!("invalid config: {error}")))
    }

    /// Write settings as pretty JSON, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load from `path`, apply process environment overrides and validate.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut settings = Self::load_from_path(path)?;
        settings.apply_env_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Override fields from `KEEPSAKE_*` variables returned by `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| normalize_text_option(lookup(&format!("{ENV_PREFIX}{name}")));

        if let Some(url) = var("API_URL") {
            self.api_base_url = Some(url);
        }
        override_secs(&var, "AUTO_SYNC_INTERVAL", &mut self.auto_sync_interval)?;
        override_secs(&var, "RETRY_INTERVAL", &mut self.retry_interval)?;
        override_secs(&var, "MAX_RETRY_DELAY", &mut self.max_retry_delay)?;
        override_secs(&var, "REQUEST_TIMEOUT", &mut self.request_timeout)?;
        override_secs(&var, "NETWORK_SETTLE_DELAY", &mut self.network_settle_delay)?;
        override_secs(&var, "FULL_SYNC_FRESHNESS", &mut self.full_sync_freshness)?;
        override_parsed(&var, "MAX_RETRIES", &mut self.max_retries)?;
        override_parsed(&var, "MAX_ENTRY_RETRIES", &mut self.max_entry_retries)?;
        override_parsed(&var, "BATCH_SIZE", &mut self.batch_size)?;
        override_bool(&var, "SYNC_ON_FOREGROUND", &mut self.sync_on_foreground)?;
        override_bool(&var, "SYNC_ON_NETWORK_RESTORE", &mut self.sync_on_network_restore)?;
        override_bool(&var, "AUTO_SYNC", &mut self.auto_sync_enabled)?;
        override_bool(&var, "BACKOFF_JITTER", &mut self.backoff_jitter)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.api_base_url {
            if !is_http_url(url) {
                return Err(Error::Config(
                    "api_base_url must include http:// or https://".to_string(),
                ));
            }
        }
        for (name, value) in [
            ("auto_sync_interval", self.auto_sync_interval),
            ("retry_interval", self.retry_interval),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.max_retry_delay < self.retry_interval {
            return Err(Error::Config(
                "max_retry_delay must not be shorter than retry_interval".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Whether a remote endpoint is configured.
    #[must_use]
    pub fn is_sync_configured(&self) -> bool {
        normalize_text_option(self.api_base_url.clone()).is_some()
    }
}

fn override_parsed<T, F>(var: &F, name: &str, target: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *target = raw
            .parse()
            .map_err(|_| Error::Config(format!("{ENV_PREFIX}{name} has invalid value '{raw}'")))?;
    }
    Ok(())
}

fn override_secs<F>(var: &F, name: &str, target: &mut Duration) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = target.as_secs();
    override_parsed(var, name, &mut secs)?;
    *target = Duration::from_secs(secs);
    Ok(())
}

fn override_bool<F>(var: &F, name: &str, target: &mut bool) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *target = match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_PREFIX}{name} must be a boolean, got '{raw}'"
                )))
            }
        };
    }
    Ok(())
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let settings = SyncSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.full_sync_freshness, Duration::from_secs(86_400));
        assert!(!settings.is_sync_configured());
    }

    #[test]
    fn json_uses_seconds_and_fills_defaults() {
        let settings =
            SyncSettings::from_json(r#"{"auto_sync_interval": 60, "sync_on_foreground": false}"#)
                .unwrap();
        assert_eq!(settings.auto_sync_interval, Duration::from_secs(60));
        assert!(!settings.sync_on_foreground);
        assert_eq!(settings.retry_interval, Duration::from_secs(30));

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["auto_sync_interval"], 60);
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let error = SyncSettings::from_json(r#"{"sync_interval": 60}"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = SyncSettings::default();
        settings
            .apply_env_overrides(env(&[
                ("KEEPSAKE_API_URL", "https://api.example.com"),
                ("KEEPSAKE_BATCH_SIZE", "25"),
                ("KEEPSAKE_RETRY_INTERVAL", "5"),
                ("KEEPSAKE_AUTO_SYNC", "off"),
            ]))
            .unwrap();

        assert_eq!(
            settings.api_base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(settings.batch_size, 25);
        assert_eq!(settings.retry_interval, Duration::from_secs(5));
        assert!(!settings.auto_sync_enabled);
    }

    #[test]
    fn env_overrides_reject_garbage() {
        let mut settings = SyncSettings::default();
        assert!(settings
            .apply_env_overrides(env(&[("KEEPSAKE_MAX_RETRIES", "many")]))
            .is_err());
        assert!(settings
            .apply_env_overrides(env(&[("KEEPSAKE_BACKOFF_JITTER", "maybe")]))
            .is_err());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero_batch = SyncSettings {
            batch_size: 0,
            ..SyncSettings::default()
        };
        assert!(zero_batch.validate().is_err());

        let bad_url = SyncSettings {
            api_base_url: Some("ftp://example.com".to_string()),
            ..SyncSettings::default()
        };
        assert!(bad_url.validate().is_err());

        let zero_interval = SyncSettings {
            auto_sync_interval: Duration::ZERO,
            ..SyncSettings::default()
        };
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepsake").join("config.json");
        assert_eq!(
            SyncSettings::load_from_path(&path).unwrap(),
            SyncSettings::default()
        );

        let settings = SyncSettings {
            api_base_url: Some("https://api.example.com".to_string()),
            max_retries: 2,
            ..SyncSettings::default()
        };
        settings.save_to_path(&path).unwrap();
        assert_eq!(SyncSettings::load_from_path(&path).unwrap(), settings);
    }
}
