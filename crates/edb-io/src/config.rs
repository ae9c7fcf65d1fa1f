//! I/O management options.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use bitflags::bitflags;
use edb_io_policy::PolicyRegistry;
use serde::{Deserialize, Serialize};
use tracing::warn;

bitflags! {
    /// Which optimizers to run and which of their side effects to suppress.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoMode: u8 {
        /// Serve cacheable reads from server-provided cache entries.
        const READ = 0b0000_0001;
        /// Queue bufferable writes and send them in ordered batches.
        const WRITE = 0b0000_0010;
        const READ_AND_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Writes leave existing cache entries in place.
        const NO_CACHE_INVALIDATION = 0b0000_0100;
        /// Reads do not force buffered writes out.
        const NO_BUFFER_FLUSHING = 0b0000_1000;
    }
}

impl Default for IoMode {
    fn default() -> Self {
        Self::READ_AND_WRITE
    }
}

const MODE_TOKENS: [(IoMode, &str); 4] = [
    (IoMode::READ, "read"),
    (IoMode::WRITE, "write"),
    (IoMode::NO_CACHE_INVALIDATION, "no_cache_invalidation"),
    (IoMode::NO_BUFFER_FLUSHING, "no_buffer_flushing"),
];

impl IoMode {
    pub fn caches(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn buffers(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = MODE_TOKENS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Unrecognized I/O mode text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown I/O mode option '{0}'")]
pub struct ModeParseError(pub String);

impl FromStr for IoMode {
    type Err = ModeParseError;

    /// Parse `read|write`, `read_and_write,no_cache_invalidation`, ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mode = IoMode::empty();
        for token in s.split(['|', ',', '+']) {
            let token = token.trim().to_ascii_lowercase().replace('-', "_");
            mode |= match token.as_str() {
                "" | "none" => IoMode::empty(),
                "read" => IoMode::READ,
                "write" => IoMode::WRITE,
                "read_and_write" => IoMode::READ_AND_WRITE,
                "no_cache_invalidation" => IoMode::NO_CACHE_INVALIDATION,
                "no_buffer_flushing" => IoMode::NO_BUFFER_FLUSHING,
                _ => return Err(ModeParseError(token)),
            };
        }
        Ok(mode)
    }
}

impl Serialize for IoMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IoMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// I/O layer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoConfig {
    /// Mode used by scoped helpers when none is given.
    #[serde(default)]
    pub mode: IoMode,

    /// Count calls that actually reach the wire, per `service/method`.
    #[serde(default)]
    pub log_traffic: bool,

    /// Policy schema file; the bundled schema is used when unset.
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
}

impl IoConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `EDB_IO_MODE` | Mode options, e.g. `read,write` |
    /// | `EDB_IO_LOG_TRAFFIC` | `1`/`true` to count wire calls |
    /// | `EDB_IO_POLICY_PATH` | Policy schema file (YAML or JSON) |
    pub fn from_env() -> Self {
        let mode = match std::env::var("EDB_IO_MODE") {
            Ok(text) => text.parse().unwrap_or_else(|err: ModeParseError| {
                warn!(value = %text, error = %err, "ignoring invalid EDB_IO_MODE");
                IoMode::default()
            }),
            Err(_) => IoMode::default(),
        };

        Self {
            mode,
            log_traffic: std::env::var("EDB_IO_LOG_TRAFFIC")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            policy_path: std::env::var_os("EDB_IO_POLICY_PATH").map(PathBuf::from),
        }
    }

    pub fn with_mode(mut self, mode: IoMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_traffic_logging(mut self, enabled: bool) -> Self {
        self.log_traffic = enabled;
        self
    }

    pub fn with_policy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_path = Some(path.into());
        self
    }

    /// Load the policy registry this config points at.
    pub fn load_registry(&self) -> anyhow::Result<PolicyRegistry> {
        match &self.policy_path {
            Some(path) => PolicyRegistry::from_file(path),
            None => PolicyRegistry::bundled().context("bundled policy schema is invalid"),
        }
    }
}
