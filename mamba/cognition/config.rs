use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use mamba_memory_data::MemoryConfig;
use serde::{Deserialize, Deserializer};
use shared_event_bus::{BusConfig, QueuePolicy};
use shared_logging::LogLevel;
use thiserror::Error;

/// Errors raised while loading the runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config {path}: {source}")]
    Io {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The document is not valid TOML for this schema.
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration document. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Event bus settings.
    pub bus: BusSection,
    /// Memory store settings.
    pub memory: MemorySection,
    /// Control loop settings.
    pub core: CoreSection,
    /// Logging settings.
    pub logging: LoggingSection,
}

/// `[bus]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Dispatcher poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Recently dispatched events retained.
    pub backlog: usize,
    /// Queue bound and overflow behavior.
    pub queue: QueuePolicy,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            backlog: 64,
            queue: QueuePolicy::Unbounded,
        }
    }
}

/// `[memory]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Persisted document; relative paths resolve against the config file.
    pub path: PathBuf,
    /// Short-term buffer capacity.
    pub max_short_term: usize,
    /// Stores between background persists; 0 disables them.
    pub persist_every: usize,
    /// Entries recalled as context per thought.
    pub recall_limit: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        let memory = MemoryConfig::default();
        Self {
            path: memory.path,
            max_short_term: memory.max_short_term,
            persist_every: memory.persist_every,
            recall_limit: 10,
        }
    }
}

/// `[core]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreSection {
    /// Pause between cognitive cycles in milliseconds.
    pub cycle_interval_ms: u64,
}

impl Default for CoreSection {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 1000,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Minimum level, case-insensitive.
    #[serde(deserialize_with = "level_from_str")]
    pub level: LogLevel,
    /// Optional JSON-lines telemetry file.
    pub json_log: Option<PathBuf>,
}

fn level_from_str<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl RuntimeConfig {
    /// Loads and validates a TOML file. Relative paths inside it resolve against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_toml(&raw, &base)
    }

    /// Parses and validates a TOML document, resolving relative paths against `base`.
    pub fn from_toml(raw: &str, base: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        if config.memory.path.is_relative() {
            config.memory.path = base.join(&config.memory.path);
        }
        if let Some(log) = config.logging.json_log.as_mut() {
            if log.is_relative() {
                *log = base.join(&*log);
            }
        }
        Ok(config)
    }

    /// Rejects zero intervals, capacities, and limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("bus.poll_interval_ms", self.bus.poll_interval_ms == 0),
            ("bus.backlog", self.bus.backlog == 0),
            (
                "bus.queue.capacity",
                matches!(self.bus.queue, QueuePolicy::Bounded { capacity: 0, .. }),
            ),
            ("memory.max_short_term", self.memory.max_short_term == 0),
            ("memory.recall_limit", self.memory.recall_limit == 0),
            ("core.cycle_interval_ms", self.core.cycle_interval_ms == 0),
        ];
        match checks.iter().find(|(_, zero)| *zero) {
            Some((field, _)) => Err(ConfigError::Invalid(format!("{field} must be positive"))),
            None => Ok(()),
        }
    }

    /// Bus construction parameters.
    #[must_use]
    pub const fn bus_config(&self) -> BusConfig {
        BusConfig {
            poll_interval: Duration::from_millis(self.bus.poll_interval_ms),
            queue: self.bus.queue,
            backlog: self.bus.backlog,
        }
    }

    /// Memory store parameters.
    #[must_use]
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            path: self.memory.path.clone(),
            max_short_term: self.memory.max_short_term,
            persist_every: self.memory.persist_every,
        }
    }

    /// Pause between cognitive cycles.
    #[must_use]
    pub const fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.core.cycle_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_event_bus::Overflow;
    use tempfile::tempdir;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RuntimeConfig::from_toml("", Path::new("/etc/mamba")).unwrap();
        assert_eq!(config.bus_config(), BusConfig::default());
        assert_eq!(config.memory.path, Path::new("/etc/mamba/memory_data.json"));
        assert_eq!(config.memory.max_short_term, 100);
        assert_eq!(config.memory.persist_every, 10);
        assert_eq!(config.cycle_interval(), Duration::from_secs(1));
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.logging.json_log.is_none());
    }

    #[test]
    fn load_reads_sections_and_resolves_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mamba.toml");
        fs::write(
            &path,
            r#"
[bus]
poll_interval_ms = 25
queue = { policy = "bounded", capacity = 8, overflow = "drop_newest" }

[memory]
path = "state/memory.json"
max_short_term = 10

[core]
cycle_interval_ms = 250

[logging]
level = "DEBUG"
json_log = "/var/log/mamba.jsonl"
"#,
        )
        .unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        let bus = config.bus_config();
        assert_eq!(bus.poll_interval, Duration::from_millis(25));
        assert_eq!(
            bus.queue,
            QueuePolicy::Bounded {
                capacity: 8,
                overflow: Overflow::DropNewest
            }
        );
        assert_eq!(bus.backlog, 64);
        assert_eq!(config.memory_config().path, dir.path().join("state/memory.json"));
        assert_eq!(config.memory_config().max_short_term, 10);
        assert_eq!(config.cycle_interval(), Duration::from_millis(250));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.logging.json_log.as_deref(),
            Some(Path::new("/var/log/mamba.jsonl"))
        );
    }

    #[test]
    fn zero_values_are_rejected() {
        let err =
            RuntimeConfig::from_toml("[core]\ncycle_interval_ms = 0", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("cycle_interval_ms")));
        let err = RuntimeConfig::from_toml(
            "[bus]\nqueue = { policy = \"bounded\", capacity = 0 }",
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_documents_and_missing_files_fail() {
        assert!(matches!(
            RuntimeConfig::from_toml("[logging]\nlevel = \"loud\"", Path::new(".")),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml("[bus]\nqueue = { policy = \"ring\" }", Path::new(".")),
            Err(ConfigError::Parse(_))
        ));
        let dir = tempdir().unwrap();
        assert!(matches!(
            RuntimeConfig::load(dir.path().join("absent.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
