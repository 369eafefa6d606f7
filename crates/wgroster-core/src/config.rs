// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::keys::{KeyProvider, NativeKeys, WgTool};
use crate::registry::default_allowed_ips;
use crate::store::JsonFileStore;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wgroster/wgroster.toml";
pub const DEFAULT_DOCUMENT_PATH: &str = "/etc/wgroster/roster.json";

pub const ENV_DOCUMENT: &str = "WGROSTER_DOCUMENT";
pub const ENV_KEYS: &str = "WGROSTER_KEYS";
pub const ENV_WG_BINARY: &str = "WGROSTER_WG_BINARY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Where keys come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyBackend {
    /// The external `wg` binary.
    #[default]
    WgTool,
    /// In-process x25519.
    Native,
}

impl FromStr for KeyBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "wg-tool" | "wg" => Ok(Self::WgTool),
            "native" => Ok(Self::Native),
            other => Err(ConfigError::InvalidValue {
                key: "keys",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for KeyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WgTool => f.write_str("wg-tool"),
            Self::Native => f.write_str("native"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub document: PathBuf,
    pub keys: KeyBackend,
    pub wg_binary: PathBuf,
    /// Routed ranges for new clients that don't specify their own.
    pub allowed_ips: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            document: PathBuf::from(DEFAULT_DOCUMENT_PATH),
            keys: KeyBackend::default(),
            wg_binary: PathBuf::from("wg"),
            allowed_ips: default_allowed_ips(),
        }
    }
}

impl Settings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config");

        let settings = match std::fs::read_to_string(path) {
            Ok(contents) => {
                let settings: Settings = toml::from_str(&contents)?;
                info!(
                    path = %path.display(),
                    document = %settings.document.display(),
                    keys = %settings.keys,
                    "loaded config"
                );
                settings
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Settings::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `WGROSTER_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(document) = lookup(ENV_DOCUMENT).filter(|v| !v.is_empty()) {
            debug!(var = ENV_DOCUMENT, "override from environment");
            self.document = PathBuf::from(document);
        }
        if let Some(keys) = lookup(ENV_KEYS).filter(|v| !v.is_empty()) {
            debug!(var = ENV_KEYS, "override from environment");
            self.keys = keys.parse()?;
        }
        if let Some(binary) = lookup(ENV_WG_BINARY).filter(|v| !v.is_empty()) {
            debug!(var = ENV_WG_BINARY, "override from environment");
            self.wg_binary = PathBuf::from(binary);
        }
        Ok(())
    }

    /// File, then process environment.
    pub fn from_file_and_env(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Self::load(path)?;
        settings.apply_env(|var| std::env::var(var).ok())?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for range in &self.allowed_ips {
            if range.parse::<IpNetwork>().is_err() {
                return Err(ConfigError::InvalidValue {
                    key: "allowed_ips",
                    value: range.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn key_provider(&self) -> Arc<dyn KeyProvider> {
        match self.keys {
            KeyBackend::WgTool => Arc::new(WgTool::new(&self.wg_binary)),
            KeyBackend::Native => Arc::new(NativeKeys),
        }
    }

    pub fn document_store(&self) -> JsonFileStore {
        JsonFileStore::new(&self.document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn parse_empty_file() {
        let parsed: Settings = toml::from_str("").unwrap();
        assert_eq!(parsed, Settings::default());
    }

    #[test]
    fn parse_full_file() {
        let parsed: Settings = toml::from_str(
            r#"
            document = "/var/lib/wgroster/roster.json"
            keys = "native"
            wg_binary = "/usr/bin/wg"
            allowed_ips = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.document, PathBuf::from("/var/lib/wgroster/roster.json"));
        assert_eq!(parsed.keys, KeyBackend::Native);
        assert_eq!(parsed.allowed_ips, vec!["10.0.0.0/8"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Settings>("colour = \"blue\"").is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn load_validates_allowed_ips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wgroster.toml");
        std::fs::write(&path, "allowed_ips = [\"everything\"]").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "allowed_ips", .. }));
    }

    #[test_case("wg-tool", Some(KeyBackend::WgTool) ; "wg tool")]
    #[test_case("wg", Some(KeyBackend::WgTool) ; "short alias")]
    #[test_case("native", Some(KeyBackend::Native) ; "native")]
    #[test_case("openssl", None ; "unknown")]
    fn key_backend_from_str(input: &str, expected: Option<KeyBackend>) {
        assert_eq!(input.parse::<KeyBackend>().ok(), expected);
    }

    #[test]
    fn env_overrides_file() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                (ENV_DOCUMENT, "/tmp/roster.json"),
                (ENV_KEYS, "native"),
                (ENV_WG_BINARY, "/opt/wg"),
            ]))
            .unwrap();
        assert_eq!(settings.document, PathBuf::from("/tmp/roster.json"));
        assert_eq!(settings.keys, KeyBackend::Native);
        assert_eq!(settings.wg_binary, PathBuf::from("/opt/wg"));
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[(ENV_DOCUMENT, "")])).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn bad_env_backend_is_an_error() {
        let mut settings = Settings::default();
        let err = settings.apply_env(env(&[(ENV_KEYS, "magic")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "keys", .. }));
    }
}
