//! Command-line and environment configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use chaintrace_core::indexer::IndexerConfig;
use chaintrace_core::store::ProjectionStore;
use chaintrace_storage::{InMemoryStorage, SqliteStorage};

/// Projection store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// SQLite file at `--db-path`.
    Sqlite,
    /// Process memory; lost on exit.
    Memory,
}

/// Options shared by every command that touches the ledger or the store.
#[derive(Debug, Clone, Args)]
pub struct IndexerArgs {
    /// Ledger JSON-RPC endpoint.
    #[arg(long, env = "RPC_URL", default_value = "http://localhost:8545")]
    pub rpc_url: String,

    /// Contract address to watch. Repeat or comma-separate for several.
    #[arg(long = "contract", env = "CONTRACT_ADDRESS", value_delimiter = ',')]
    pub contracts: Vec<String>,

    /// First block to scan when the store is empty.
    #[arg(long, env = "START_BLOCK")]
    pub start_block: Option<u64>,

    /// SQLite database path.
    #[arg(long, env = "DB_PATH", default_value = "./observer.db")]
    pub db_path: String,

    /// Projection store backend.
    #[arg(long, env = "STORAGE", value_enum, default_value = "sqlite")]
    pub storage: Backend,

    /// Head polling interval in live mode, milliseconds.
    #[arg(long, env = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// JSON file holding an indexer configuration. Explicit flags win.
    #[arg(long, env = "CHAINTRACE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl IndexerArgs {
    /// Resolve the indexer configuration: defaults, then the config file,
    /// then explicit flags.
    pub fn indexer_config(&self) -> Result<IndexerConfig> {
        let base = match &self.config {
            Some(path) => load_config(path)?,
            None => IndexerConfig::default(),
        };
        Ok(self.apply_overrides(base))
    }

    fn apply_overrides(&self, mut config: IndexerConfig) -> IndexerConfig {
        let contracts: Vec<String> = self
            .contracts
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if !contracts.is_empty() {
            config.watched_contracts = contracts;
        }
        if let Some(start) = self.start_block {
            config.start_block = start;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        config
    }

    /// Open the configured projection store.
    pub async fn open_store(&self) -> Result<Arc<dyn ProjectionStore>> {
        let store: Arc<dyn ProjectionStore> = match self.storage {
            Backend::Memory => Arc::new(InMemoryStorage::new()),
            Backend::Sqlite if self.db_path == ":memory:" => Arc::new(
                SqliteStorage::in_memory()
                    .await
                    .context("Failed to open in-memory SQLite store")?,
            ),
            Backend::Sqlite => Arc::new(
                SqliteStorage::open(&self.db_path)
                    .await
                    .with_context(|| format!("Failed to open SQLite store at {}", self.db_path))?,
            ),
        };
        Ok(store)
    }
}

/// Read an `IndexerConfig` from a JSON file.
pub fn load_config(path: &Path) -> Result<IndexerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaintrace_core::store::ProjectionReader;

    fn args() -> IndexerArgs {
        IndexerArgs {
            rpc_url: "http://localhost:8545".into(),
            contracts: vec![],
            start_block: None,
            db_path: ":memory:".into(),
            storage: Backend::Memory,
            poll_interval_ms: None,
            config: None,
        }
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let config = args().indexer_config().unwrap();
        assert_eq!(config.start_block, 0);
        assert!(config.watched_contracts.is_empty());
    }

    #[test]
    fn flags_override_file_values() {
        let base: IndexerConfig = serde_json::from_str(
            r#"{"start_block": 50, "watched_contracts": ["0xfile"], "progress_interval": 10}"#,
        )
        .unwrap();

        let mut a = args();
        a.contracts = vec!["0xAA".into(), " ".into()];
        a.start_block = Some(7);
        let config = a.apply_overrides(base);

        assert_eq!(config.watched_contracts, vec!["0xAA".to_string()]);
        assert_eq!(config.start_block, 7);
        assert_eq!(config.progress_interval, 10);
    }

    #[test]
    fn file_values_kept_when_flags_absent() {
        let path = std::env::temp_dir().join(format!("chaintrace-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"start_block": 42, "poll_interval_ms": 500}"#).unwrap();

        let mut a = args();
        a.config = Some(path.clone());
        let config = a.indexer_config().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.start_block, 42);
        assert_eq!(config.poll_interval_ms, 500);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let mut a = args();
        a.config = Some(PathBuf::from("/nonexistent/chaintrace.json"));
        let err = a.indexer_config().unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[tokio::test]
    async fn opens_memory_backends() {
        let store = args().open_store().await.unwrap();
        assert_eq!(store.cursor().await.unwrap(), None);

        let mut a = args();
        a.storage = Backend::Sqlite;
        let store = a.open_store().await.unwrap();
        assert_eq!(store.participant_count().await.unwrap(), 0);
    }
}
