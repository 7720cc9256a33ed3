use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MANAGEMENT_PASSWORD_ENV: &str = "CREDGATE_MANAGEMENT_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config field {field}: {detail}")]
    InvalidField { field: &'static str, detail: String },
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > file > defaults. Unknown file keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub auth_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Inbound API keys accepted by the serving plane.
    pub api_keys: Vec<String>,
    /// Spawn login browsers in incognito/private mode (multi-account support).
    pub incognito_browser: bool,
    pub sticky_session_ttl_secs: u64,
    pub sticky_gc_interval_secs: u64,
    pub sticky_gc_min_entries: usize,
    pub refresh_default_lead_secs: u64,
    pub refresh_tick_secs: u64,
    pub backoff_cap_level: u8,
    /// Optional outbound proxy for upstream OAuth and probe calls.
    pub proxy: Option<String>,
    /// Management-plane bearer password. Environment only, never the file.
    #[serde(skip)]
    pub management_password: Option<String>,
}

impl GlobalConfig {
    pub fn sticky_session_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_session_ttl_secs)
    }

    pub fn sticky_gc_interval(&self) -> Duration {
        Duration::from_secs(self.sticky_gc_interval_secs)
    }

    pub fn refresh_default_lead(&self) -> Duration {
        Duration::from_secs(self.refresh_default_lead_secs)
    }

    pub fn refresh_tick(&self) -> Duration {
        Duration::from_secs(self.refresh_tick_secs)
    }
}

/// Optional layer used for merging configuration sources.
///
/// The file format deserializes into this patch so that absent keys fall
/// through to defaults while unrecognized keys are rejected outright.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfigPatch {
    pub auth_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_keys: Option<Vec<String>>,
    pub incognito_browser: Option<bool>,
    pub sticky_session_ttl_secs: Option<u64>,
    pub sticky_gc_interval_secs: Option<u64>,
    pub sticky_gc_min_entries: Option<usize>,
    pub refresh_default_lead_secs: Option<u64>,
    pub refresh_tick_secs: Option<u64>,
    pub backoff_cap_level: Option<u8>,
    pub proxy: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.auth_dir.is_some() {
            self.auth_dir = other.auth_dir;
        }
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.api_keys.is_some() {
            self.api_keys = other.api_keys;
        }
        if other.incognito_browser.is_some() {
            self.incognito_browser = other.incognito_browser;
        }
        if other.sticky_session_ttl_secs.is_some() {
            self.sticky_session_ttl_secs = other.sticky_session_ttl_secs;
        }
        if other.sticky_gc_interval_secs.is_some() {
            self.sticky_gc_interval_secs = other.sticky_gc_interval_secs;
        }
        if other.sticky_gc_min_entries.is_some() {
            self.sticky_gc_min_entries = other.sticky_gc_min_entries;
        }
        if other.refresh_default_lead_secs.is_some() {
            self.refresh_default_lead_secs = other.refresh_default_lead_secs;
        }
        if other.refresh_tick_secs.is_some() {
            self.refresh_tick_secs = other.refresh_tick_secs;
        }
        if other.backoff_cap_level.is_some() {
            self.backoff_cap_level = other.backoff_cap_level;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, ConfigError> {
        let sticky_session_ttl_secs = self.sticky_session_ttl_secs.unwrap_or(3600);
        if sticky_session_ttl_secs == 0 {
            return Err(ConfigError::InvalidField {
                field: "sticky_session_ttl_secs",
                detail: "must be positive".to_string(),
            });
        }
        let refresh_tick_secs = self.refresh_tick_secs.unwrap_or(30);
        if refresh_tick_secs == 0 {
            return Err(ConfigError::InvalidField {
                field: "refresh_tick_secs",
                detail: "must be positive".to_string(),
            });
        }
        Ok(GlobalConfig {
            auth_dir: self.auth_dir.unwrap_or_else(default_auth_dir),
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8317),
            api_keys: self.api_keys.unwrap_or_default(),
            incognito_browser: self.incognito_browser.unwrap_or(true),
            sticky_session_ttl_secs,
            sticky_gc_interval_secs: self.sticky_gc_interval_secs.unwrap_or(600),
            sticky_gc_min_entries: self.sticky_gc_min_entries.unwrap_or(1024),
            refresh_default_lead_secs: self.refresh_default_lead_secs.unwrap_or(300),
            refresh_tick_secs,
            backoff_cap_level: self.backoff_cap_level.unwrap_or(5),
            proxy: self.proxy,
            management_password: None,
        })
    }
}

fn default_auth_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".credgate").join("auth"),
        None => PathBuf::from(".credgate").join("auth"),
    }
}

/// Load configuration from an optional file, then apply environment overrides.
///
/// A missing file is not an error (defaults apply); a malformed or
/// unrecognized-key file is.
pub fn load_config(path: Option<&Path>) -> Result<GlobalConfig, ConfigError> {
    let mut merged = GlobalConfigPatch::default();

    if let Some(path) = path
        && path.exists()
    {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file_patch: GlobalConfigPatch =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        merged.overlay(file_patch);
    }

    merged.overlay(patch_from_env());

    let mut config = merged.into_config()?;
    config.management_password = std::env::var(MANAGEMENT_PASSWORD_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    Ok(config)
}

fn patch_from_env() -> GlobalConfigPatch {
    let mut patch = GlobalConfigPatch::default();
    if let Ok(value) = std::env::var("CREDGATE_AUTH_DIR")
        && !value.trim().is_empty()
    {
        patch.auth_dir = Some(PathBuf::from(value.trim()));
    }
    if let Ok(value) = std::env::var("CREDGATE_HOST")
        && !value.trim().is_empty()
    {
        patch.host = Some(value.trim().to_string());
    }
    if let Ok(value) = std::env::var("CREDGATE_PORT")
        && let Ok(port) = value.trim().parse::<u16>()
    {
        patch.port = Some(port);
    }
    if let Ok(value) = std::env::var("CREDGATE_PROXY")
        && !value.trim().is_empty()
    {
        patch.proxy = Some(value.trim().to_string());
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_absent() {
        let config = GlobalConfigPatch::default().into_config().unwrap();
        assert_eq!(config.port, 8317);
        assert_eq!(config.sticky_session_ttl_secs, 3600);
        assert_eq!(config.sticky_gc_interval_secs, 600);
        assert_eq!(config.sticky_gc_min_entries, 1024);
        assert_eq!(config.refresh_default_lead_secs, 300);
        assert_eq!(config.backoff_cap_level, 5);
        assert!(config.incognito_browser);
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_str::<GlobalConfigPatch>(r#"{"prot":8080}"#).unwrap_err();
        assert!(err.to_string().contains("prot"), "error: {err}");
    }

    #[test]
    fn overlay_prefers_later_layers() {
        let mut base = GlobalConfigPatch {
            port: Some(1000),
            host: Some("0.0.0.0".to_string()),
            ..GlobalConfigPatch::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(2000),
            ..GlobalConfigPatch::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.port, 2000);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn zero_ttl_is_invalid() {
        let patch = GlobalConfigPatch {
            sticky_session_ttl_secs: Some(0),
            ..GlobalConfigPatch::default()
        };
        assert!(patch.into_config().is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credgate.json");
        std::fs::write(&path, r#"{"port": 9999, "api_keys": ["k1", "k2"]}"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.api_keys, vec!["k1", "k2"]);
    }
}
