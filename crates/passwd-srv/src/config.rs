//! YAML configuration.
//!
//! The file lists file-system paths by type:
//!
//! ```yaml
//! values:
//!   - type: SOCKET
//!     path: /var/run/passwd-srv/passwd-srv.sock
//!     description: socket the daemon listens on
//!   - type: PUB_KEY
//!     path: /var/run/passwd-srv/passwd-srv-pub.pem
//!     description: published server public key
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/passwd-srv/passwd-srv.yaml";

/// Longest path accepted for any entry, in bytes.
pub const MAX_PATH_LEN: usize = 255;

/// Kinds of path the daemon needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathType {
    Socket,
    PubKey,
}

impl PathType {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "SOCKET" => Some(Self::Socket),
            "PUB_KEY" => Some(Self::PubKey),
            _ => None,
        }
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Socket => "SOCKET",
            Self::PubKey => "PUB_KEY",
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    values: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub path: PathBuf,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<PathType, PathEntry>,
}

impl Config {
    /// Load and validate the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|err| match err {
            ParseFailure::Yaml(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            ParseFailure::Config(err) => err,
        })
    }

    /// Parse configuration text. Useful for tests and embedded defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text).map_err(|err| match err {
            ParseFailure::Yaml(source) => ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            },
            ParseFailure::Config(err) => err,
        })
    }

    fn parse(text: &str) -> Result<Self, ParseFailure> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(ParseFailure::Yaml)?;
        let mut entries = HashMap::new();

        for entry in raw.values {
            let Some(kind) = PathType::from_key(&entry.kind) else {
                warn!("Ignoring config entry with unknown type {:?}", entry.kind);
                continue;
            };
            if entries.contains_key(&kind) {
                warn!("Duplicate config entry for {kind}, keeping the first");
                continue;
            }
            if entry.path.len() > MAX_PATH_LEN {
                return Err(ParseFailure::Config(ConfigError::PathTooLong {
                    kind,
                    len: entry.path.len(),
                    max: MAX_PATH_LEN,
                }));
            }
            entries.insert(
                kind,
                PathEntry {
                    path: PathBuf::from(entry.path),
                    description: entry.description,
                },
            );
        }

        Ok(Self { entries })
    }

    pub fn get(&self, kind: PathType) -> Option<&PathEntry> {
        self.entries.get(&kind)
    }

    pub fn socket_path(&self) -> Result<&Path, ConfigError> {
        self.path_of(PathType::Socket)
    }

    pub fn public_key_path(&self) -> Result<&Path, ConfigError> {
        self.path_of(PathType::PubKey)
    }

    fn path_of(&self, kind: PathType) -> Result<&Path, ConfigError> {
        self.entries
            .get(&kind)
            .map(|e| e.path.as_path())
            .ok_or(ConfigError::Missing(kind))
    }
}

enum ParseFailure {
    Yaml(serde_yaml::Error),
    Config(ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
values:
  - type: SOCKET
    path: /var/run/passwd-srv/passwd-srv.sock
    description: daemon socket
  - type: PUB_KEY
    path: /var/run/passwd-srv/passwd-srv-pub.pem
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(
            config.socket_path().unwrap(),
            Path::new("/var/run/passwd-srv/passwd-srv.sock")
        );
        assert_eq!(
            config.public_key_path().unwrap(),
            Path::new("/var/run/passwd-srv/passwd-srv-pub.pem")
        );
        assert_eq!(
            config.get(PathType::Socket).unwrap().description.as_deref(),
            Some("daemon socket")
        );
        assert!(config.get(PathType::PubKey).unwrap().description.is_none());
    }

    #[test]
    fn test_shipped_config() {
        let config = Config::from_yaml_str(include_str!("../passwd-srv.yaml")).unwrap();
        assert!(config.socket_path().is_ok());
        assert!(config.public_key_path().is_ok());
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let config = Config::from_yaml_str(
            "values:\n  - type: LOGFILE\n    path: /tmp/x\n  - type: SOCKET\n    path: /tmp/s\n",
        )
        .unwrap();
        assert_eq!(config.socket_path().unwrap(), Path::new("/tmp/s"));
        assert!(matches!(
            config.public_key_path(),
            Err(ConfigError::Missing(PathType::PubKey))
        ));
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let config = Config::from_yaml_str(
            "values:\n  - type: SOCKET\n    path: /tmp/first\n  - type: SOCKET\n    path: /tmp/second\n",
        )
        .unwrap();
        assert_eq!(config.socket_path().unwrap(), Path::new("/tmp/first"));
    }

    #[test]
    fn test_overlong_path_is_rejected() {
        let long = format!("/{}", "a".repeat(MAX_PATH_LEN));
        let text = format!("values:\n  - type: PUB_KEY\n    path: {long}\n");
        let err = Config::from_yaml_str(&text).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::PathTooLong {
                kind: PathType::PubKey,
                len: 256,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = Config::from_yaml_str("values: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd-srv.yaml");
        fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.socket_path().is_ok());
    }
}
