//! Connection settings for [`Database::connect`](crate::storage::Database::connect),
//! optionally read from a TOML file.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config: unable to read store settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: invalid TOML in store settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config: store settings file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Connection settings for the backing SQLite database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the database file, or `:memory:`.
    pub database_path: String,

    /// Upper bound on pooled connections.
    pub max_connections: u32,

    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout_ms: u64,

    /// How long a caller waits for a free pooled connection.
    pub acquire_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: "feedstore.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5000,
            acquire_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    /// Files above 1 MB are refused unread.
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 4] = [
        "database_path",
        "max_connections",
        "busy_timeout_ms",
        "acquire_timeout_secs",
    ];

    /// Default settings pointed at `path`.
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            database_path: path.into(),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Whether the configured database lives only in memory.
    pub fn is_in_memory(&self) -> bool {
        self.database_path == ":memory:"
    }

    /// Read settings from a TOML file.
    ///
    /// A missing or blank file yields the defaults. Keys this crate does not
    /// know are reported and skipped.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let Some(content) = read_limited(path)? else {
            tracing::debug!(path = %path.display(), "Store config not present, using defaults");
            return Ok(Self::default());
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let table: toml::Table = content.parse()?;
        table
            .keys()
            .filter(|key| !Self::KNOWN_KEYS.contains(&key.as_str()))
            .for_each(|key| {
                tracing::warn!(%key, path = %path.display(), "Skipping unknown store setting")
            });

        let config: StoreConfig = toml::Value::Table(table).try_into()?;
        tracing::info!(
            path = %path.display(),
            database = %config.database_path,
            max_connections = config.max_connections,
            "Store configuration loaded"
        );
        Ok(config)
    }
}

/// Contents of `path`, or `None` when it does not exist.
fn read_limited(path: &Path) -> Result<Option<String>, ConfigError> {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if size > StoreConfig::MAX_FILE_SIZE {
        return Err(ConfigError::TooLarge(format!(
            "{} is {} bytes, limit is {}",
            path.display(),
            size,
            StoreConfig::MAX_FILE_SIZE
        )));
    }

    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        // removed after the size check
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Tests
// ============================================================================
