//! Pile configuration.
//!
//! The pile table is loaded once at process start and shared read-only by
//! every component. A pile that is not in the table does not exist, no matter
//! what the metadata store still remembers about it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Upload ceiling applied when a pile does not configure one (5 MiB).
pub const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0}: no such pile")]
    NoSuchPile(String),
    #[error("no piles configured")]
    NoPiles,
    #[error("invalid pile name {0:?}")]
    InvalidPileName(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// How long entries of a pile live. Zero means forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lifetime(Duration);

impl Lifetime {
    pub const FOREVER: Lifetime = Lifetime(Duration::ZERO);

    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn is_forever(&self) -> bool {
        self.0.is_zero()
    }

    /// Point in time after which an entry created at `created` is expired.
    /// `None` when entries never expire.
    pub fn expires_at(&self, created: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_forever() {
            return None;
        }
        let span = chrono::Duration::from_std(self.0).ok()?;
        created.checked_add_signed(span)
    }

    pub fn is_expired(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.expires_at(created)
            .map(|expires| now > expires)
            .unwrap_or(false)
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_forever() {
            f.write_str("0s")
        } else {
            write!(f, "{}", humantime::format_duration(self.0))
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLifetime {
    Nanos(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for Lifetime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawLifetime::deserialize(deserializer)? {
            RawLifetime::Nanos(nanos) => Ok(Lifetime(Duration::from_nanos(nanos))),
            RawLifetime::Text(text) => {
                let text = text.trim();
                if text.is_empty() || text == "0" {
                    return Ok(Lifetime::FOREVER);
                }
                humantime::parse_duration(text)
                    .map(Lifetime)
                    .map_err(|err| serde::de::Error::custom(format!("invalid lifetime: {err}")))
            }
        }
    }
}

impl Serialize for Lifetime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

fn default_max_size() -> u64 {
    DEFAULT_MAX_SIZE
}

/// Per-pile settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PileConfig {
    #[serde(default)]
    pub lifetime: Lifetime,
    /// Value for `Access-Control-Allow-Origin`, empty for none.
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub read_key: String,
    #[serde(default)]
    pub write_key: String,
    #[serde(default)]
    pub list_key: String,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
}

impl Default for PileConfig {
    fn default() -> Self {
        Self {
            lifetime: Lifetime::FOREVER,
            origin: String::new(),
            read_key: String::new(),
            write_key: String::new(),
            list_key: String::new(),
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

/// Process-wide configuration: the pile table plus the trusted forwarding header.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub piles: BTreeMap<String, PileConfig>,
    #[serde(default)]
    pub forward_header: Option<String>,
}

impl Config {
    /// Load the pile table from a JSON or TOML file (chosen by extension).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        tracing::debug!(filename = %shown, "Loading pile configuration");
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        let config: Config = if is_toml {
            toml::from_str(&raw).map_err(|err| ConfigError::Parse {
                path: shown.clone(),
                reason: err.to_string(),
            })?
        } else {
            serde_json::from_str(&raw).map_err(|err| ConfigError::Parse {
                path: shown.clone(),
                reason: err.to_string(),
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.piles.is_empty() {
            return Err(ConfigError::NoPiles);
        }
        for name in self.piles.keys() {
            if !is_valid_pile_name(name) {
                return Err(ConfigError::InvalidPileName(name.clone()));
            }
        }
        Ok(())
    }

    pub fn pile(&self, name: &str) -> Result<&PileConfig, ConfigError> {
        self.piles
            .get(name)
            .ok_or_else(|| ConfigError::NoSuchPile(name.to_string()))
    }

    pub fn pile_names(&self) -> impl Iterator<Item = &str> {
        self.piles.keys().map(String::as_str)
    }

    /// Largest upload ceiling across all piles.
    pub fn largest_max_size(&self) -> u64 {
        self.piles
            .values()
            .map(|pile| pile.max_size)
            .max()
            .unwrap_or(DEFAULT_MAX_SIZE)
    }

    pub fn forward_header(&self) -> Option<&str> {
        self.forward_header
            .as_deref()
            .map(str::trim)
            .filter(|header| !header.is_empty())
    }
}

/// Pile names double as directory names, so they must stay a single path segment.
pub fn is_valid_pile_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.starts_with("__sled__")
}
