//! Environment-driven configuration
//!
//! Reads `.env` (if present) and `CHAT_HISTORY_*` variables to pick a
//! storage backend, its load policy and an optional trimming strategy.

use crate::error::HistoryError;
use crate::store::LoadPolicy;
use crate::strategy::TrimmingConfig;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_JSON_DIR: &str = "chat_histories";
const DEFAULT_SQLITE_PATH: &str = "chat_history.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Which `ChatHistoryStore` to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Json { dir: PathBuf },
    Sqlite { path: PathBuf },
    Postgres { url: String },
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Json { .. } => "json",
            BackendKind::Sqlite { .. } => "sqlite",
            BackendKind::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub backend: BackendKind,
    pub load_policy: LoadPolicy,
    /// Pool size for the relational backends
    pub max_connections: u32,
    /// Persist after every `add_message`
    pub auto_save: bool,
    pub trimming: Option<TrimmingConfig>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            load_policy: LoadPolicy::FailFast,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            auto_save: true,
            trimming: None,
        }
    }
}

impl HistoryConfig {
    /// Load from the process environment (and `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let database_url = get("POSTGRES_URL").or_else(|| get("DATABASE_URL"));

        let backend_name = get("CHAT_HISTORY_BACKEND").unwrap_or_else(|| {
            if database_url.is_some() {
                "postgres".to_string()
            } else {
                "memory".to_string()
            }
        });

        let backend = match backend_name.trim().to_lowercase().as_str() {
            "memory" => BackendKind::Memory,
            "json" => BackendKind::Json {
                dir: get("CHAT_HISTORY_DIR")
                    .unwrap_or_else(|| DEFAULT_JSON_DIR.to_string())
                    .into(),
            },
            "sqlite" => BackendKind::Sqlite {
                path: get("CHAT_HISTORY_SQLITE_PATH")
                    .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string())
                    .into(),
            },
            "postgres" => BackendKind::Postgres {
                url: database_url.ok_or_else(|| {
                    HistoryError::ConfigError(
                        "postgres backend requires POSTGRES_URL or DATABASE_URL".to_string(),
                    )
                })?,
            },
            other => {
                return Err(HistoryError::ConfigError(format!(
                    "unknown CHAT_HISTORY_BACKEND '{}'",
                    other
                )));
            }
        };

        let load_policy = match get("CHAT_HISTORY_LOAD_POLICY") {
            Some(value) => value.parse()?,
            None => LoadPolicy::default(),
        };

        let max_connections =
            parse_var(&get, "CHAT_HISTORY_MAX_CONNECTIONS")?.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(HistoryError::ConfigError(
                "CHAT_HISTORY_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        let auto_save = parse_var(&get, "CHAT_HISTORY_AUTO_SAVE")?.unwrap_or(true);

        let max_messages = parse_var(&get, "CHAT_HISTORY_MAX_MESSAGES")?;
        let max_tokens = parse_var(&get, "CHAT_HISTORY_MAX_TOKENS")?;
        let trimming = if max_messages.is_some() || max_tokens.is_some() {
            let defaults = TrimmingConfig::default();
            Some(TrimmingConfig {
                max_messages,
                max_tokens,
                preserve_system: parse_var(&get, "CHAT_HISTORY_PRESERVE_SYSTEM")?
                    .unwrap_or(defaults.preserve_system),
                preserve_recent: parse_var(&get, "CHAT_HISTORY_PRESERVE_RECENT")?
                    .unwrap_or(defaults.preserve_recent),
            })
        } else {
            None
        };

        Ok(Self {
            backend,
            load_policy,
            max_connections,
            auto_save,
            trimming,
        })
    }
}

fn parse_var<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                HistoryError::ConfigError(format!("invalid value for {}: {:?} ({})", key, raw, e))
            })
        })
        .transpose()
}
