//! Configuration resolution for `SealDrop`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/sealdrop/settings.json)
//! 3. Project config (.sealdrop/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files may be partial. Each layer is merged key by key onto the layers
//! below it, so a project file that only sets `relay.addr` keeps every other
//! value from the global file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sealdrop_crypto::{EnvelopeEncoding, KeyDerivation};

use crate::error::{Error, Result};

pub const ENV_RELAY_ADDR: &str = "SEALDROP_RELAY_ADDR";
pub const ENV_FALLBACK_MS: &str = "SEALDROP_FALLBACK_MS";
pub const ENV_KEY_DERIVATION: &str = "SEALDROP_KEY_DERIVATION";
pub const ENV_ENVELOPE_ENCODING: &str = "SEALDROP_ENVELOPE_ENCODING";
pub const ENV_DOWNLOAD_DIR: &str = "SEALDROP_DOWNLOAD_DIR";
pub const ENV_LOG_LEVEL: &str = "SEALDROP_LOG_LEVEL";

/// Complete `SealDrop` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub invitation: InvitationConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Relay connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// `host:port` of the NDJSON relay.
    pub addr: String,
    pub connect_timeout_secs: u64,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:10000".to_string(),
            connect_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Key exchange settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HandshakeConfig {
    /// How long to wait for the peer's `KEY_EXCHANGE` before entering
    /// `Ready` regardless.
    pub fallback_timeout_ms: u64,
    pub key_derivation: KeyDerivation,
    /// Wire encoding for envelopes this peer sends.
    pub outbound_encoding: EnvelopeEncoding,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            fallback_timeout_ms: 3000,
            key_derivation: KeyDerivation::default(),
            outbound_encoding: EnvelopeEncoding::default(),
        }
    }
}

impl HandshakeConfig {
    pub const fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }
}

/// Parameters announced to the relay on create / join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InvitationConfig {
    pub expires_in_minutes: u32,
    pub create_intent: String,
    pub create_capabilities: Vec<String>,
    pub join_intent: String,
    pub join_capabilities: Vec<String>,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            expires_in_minutes: 30,
            create_intent: "send_files".to_string(),
            create_capabilities: vec!["file_send".to_string(), "encryption".to_string()],
            join_intent: "receive_files".to_string(),
            join_capabilities: vec!["file_receive".to_string(), "encryption".to_string()],
        }
    }
}

/// File transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransferConfig {
    /// Where received files are written.
    pub download_dir: PathBuf,
    /// Largest file accepted for sending. Whole files travel in one message.
    pub max_file_bytes: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            max_file_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.relay.addr.trim().is_empty() {
            return Err(Error::Config("relay.addr must not be empty".into()));
        }
        if self.relay.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "relay.connect_timeout_secs must be positive".into(),
            ));
        }
        if self.transfer.max_file_bytes == 0 {
            return Err(Error::Config(
                "transfer.max_file_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution from the real global
/// path and process environment.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    load_config_from(global_config_path().as_deref(), project_dir, |key| {
        std::env::var(key).ok()
    })
}

/// Load configuration from explicit sources. `env` looks up one variable.
pub fn load_config_from(
    global_path: Option<&Path>,
    project_dir: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(path) = global_path.filter(|p| p.exists()) {
        merge_config(&mut merged, load_config_file(path)?);
        tracing::debug!(path = %path.display(), layer = "global", "Loaded config layer");
    }

    if let Some(dir) = project_dir {
        let path = project_config_path(dir);
        if path.exists() {
            merge_config(&mut merged, load_config_file(&path)?);
            tracing::debug!(path = %path.display(), layer = "project", "Loaded config layer");
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, env);
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sealdrop").join("settings.json"))
}

pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".sealdrop").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Recursively merge `overlay` onto `base`. Objects merge by key; any other
/// overlay value replaces the base value.
fn merge_config(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_config(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if let Some(val) = env(ENV_RELAY_ADDR) {
        config.relay.addr = val;
    }
    if let Some(val) = env(ENV_FALLBACK_MS) {
        match val.parse() {
            Ok(ms) => config.handshake.fallback_timeout_ms = ms,
            Err(e) => tracing::warn!(var = ENV_FALLBACK_MS, value = %val, error = %e, "Ignoring invalid override"),
        }
    }
    if let Some(val) = env(ENV_KEY_DERIVATION) {
        match val.parse() {
            Ok(kdf) => config.handshake.key_derivation = kdf,
            Err(e) => tracing::warn!(var = ENV_KEY_DERIVATION, value = %val, error = %e, "Ignoring invalid override"),
        }
    }
    if let Some(val) = env(ENV_ENVELOPE_ENCODING) {
        match val.parse() {
            Ok(enc) => config.handshake.outbound_encoding = enc,
            Err(e) => tracing::warn!(var = ENV_ENVELOPE_ENCODING, value = %val, error = %e, "Ignoring invalid override"),
        }
    }
    if let Some(val) = env(ENV_DOWNLOAD_DIR) {
        config.transfer.download_dir = PathBuf::from(val);
    }
    if let Some(val) = env(ENV_LOG_LEVEL) {
        config.relay.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn default_config_has_3s_fallback() {
        let config = Config::default();
        assert_eq!(config.handshake.fallback_timeout(), Duration::from_secs(3));
        assert_eq!(config.handshake.key_derivation, KeyDerivation::Raw);
        assert_eq!(config.handshake.outbound_encoding, EnvelopeEncoding::Bytes);
    }

    #[test]
    fn default_invitation_parameters() {
        let inv = InvitationConfig::default();
        assert_eq!(inv.expires_in_minutes, 30);
        assert_eq!(inv.create_intent, "send_files");
        assert_eq!(inv.join_capabilities, ["file_receive", "encryption"]);
    }

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            load_config_from(Some(&dir.path().join("nope.json")), Some(dir.path()), no_env)
                .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn project_layer_overrides_global_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global").join("settings.json");
        write(
            &global,
            r#"{"relay":{"addr":"relay.example:9000","connect_timeout_secs":4}}"#,
        );
        let project = dir.path().join("proj");
        write(
            &project_config_path(&project),
            r#"{"relay":{"addr":"10.0.0.1:10000"},"handshake":{"outbound_encoding":"base64"}}"#,
        );

        let config = load_config_from(Some(&global), Some(&project), no_env).unwrap();
        assert_eq!(config.relay.addr, "10.0.0.1:10000");
        assert_eq!(config.relay.connect_timeout_secs, 4);
        assert_eq!(config.handshake.outbound_encoding, EnvelopeEncoding::Base64);
        assert_eq!(config.handshake.fallback_timeout_ms, 3000);
    }

    #[test]
    fn env_overrides_files() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &project_config_path(dir.path()),
            r#"{"handshake":{"fallback_timeout_ms":100}}"#,
        );
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_FALLBACK_MS, "750"),
            (ENV_KEY_DERIVATION, "hkdf-sha256"),
            (ENV_DOWNLOAD_DIR, "/tmp/in"),
        ]);
        let config = load_config_from(None, Some(dir.path()), |k| {
            vars.get(k).map(ToString::to_string)
        })
        .unwrap();
        assert_eq!(config.handshake.fallback_timeout_ms, 750);
        assert_eq!(config.handshake.key_derivation, KeyDerivation::HkdfSha256);
        assert_eq!(config.transfer.download_dir, PathBuf::from("/tmp/in"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let config = load_config_from(None, None, |k| {
            (k == ENV_FALLBACK_MS || k == ENV_ENVELOPE_ENCODING).then(|| "bogus".to_string())
        })
        .unwrap();
        assert_eq!(config.handshake, HandshakeConfig::default());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write(&project_config_path(dir.path()), "{ not json");
        let err = load_config_from(None, Some(dir.path()), no_env).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn wrong_type_in_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &project_config_path(dir.path()),
            r#"{"handshake":{"key_derivation":"md5"}}"#,
        );
        let err = load_config_from(None, Some(dir.path()), no_env).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validate_rejects_empty_addr() {
        let mut config = Config::default();
        config.relay.addr = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn merge_replaces_arrays_wholesale() {
        let mut base = serde_json::json!({"a": {"list": [1, 2, 3], "keep": true}});
        merge_config(&mut base, serde_json::json!({"a": {"list": [9]}}));
        assert_eq!(base, serde_json::json!({"a": {"list": [9], "keep": true}}));
    }
}
