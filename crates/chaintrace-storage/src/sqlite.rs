//! SQLite projection store.
//!
//! Persists blocks, participants, items, inventory, the audit ledger and the
//! cursor to a single SQLite file. Every block commit runs in one `sqlx`
//! transaction; a failed compare-and-update rolls the whole block back.
//!
//! # Usage
//! ```rust,no_run
//! use chaintrace_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./observer.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chaintrace_core::batch::BlockBatch;
use chaintrace_core::error::IndexerError;
use chaintrace_core::store::{ProjectionReader, ProjectionStore, SnapshotKeys, StateSnapshot};
use chaintrace_core::types::{
    BlockRecord, EventKind, InventoryEntry, Item, Participant, Role, TransactionRecord,
};

fn storage(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        height     INTEGER PRIMARY KEY,
        hash       TEXT    NOT NULL,
        timestamp  INTEGER NOT NULL,
        processed  INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS participants (
        address             TEXT    PRIMARY KEY,
        name                TEXT    NOT NULL,
        role_code           INTEGER NOT NULL,
        metadata            TEXT    NOT NULL,
        first_seen_height   INTEGER NOT NULL,
        last_updated_height INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS items (
        barcode            TEXT    PRIMARY KEY,
        name               TEXT    NOT NULL,
        manufacturer_name  TEXT    NOT NULL,
        manufactured_label TEXT    NOT NULL,
        creator            TEXT    NOT NULL,
        initial_volume     INTEGER NOT NULL,
        created_height     INTEGER NOT NULL,
        created_log_index  INTEGER NOT NULL,
        created_tx_hash    TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS inventory (
        holder              TEXT    NOT NULL,
        barcode             TEXT    NOT NULL,
        volume              INTEGER NOT NULL CHECK (volume >= 0),
        last_updated_height INTEGER NOT NULL,
        PRIMARY KEY (holder, barcode)
    );",
    "CREATE TABLE IF NOT EXISTS transactions (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        kind            TEXT    NOT NULL,
        barcode         TEXT    NOT NULL,
        from_address    TEXT,
        to_address      TEXT    NOT NULL,
        volume          INTEGER NOT NULL,
        block_height    INTEGER NOT NULL,
        log_index       INTEGER NOT NULL,
        tx_hash         TEXT    NOT NULL,
        block_timestamp INTEGER NOT NULL,
        transfer_time   INTEGER,
        UNIQUE (block_height, log_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_tx_barcode ON transactions (barcode, block_height, log_index);",
    "CREATE INDEX IF NOT EXISTS idx_tx_to ON transactions (to_address);",
    "CREATE INDEX IF NOT EXISTS idx_tx_from ON transactions (from_address);",
    "CREATE INDEX IF NOT EXISTS idx_inventory_barcode ON inventory (barcode);",
    "CREATE TABLE IF NOT EXISTS scan_cursor (
        id     INTEGER PRIMARY KEY CHECK (id = 0),
        height INTEGER NOT NULL
    );",
];

const TX_COLUMNS: &str = "kind, barcode, from_address, to_address, volume, block_height, \
                          log_index, tx_hash, block_timestamp, transfer_time";

/// SQLite-backed projection store.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./observer.db"`) or a full
    /// SQLite URL (`"sqlite:./observer.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage)?;
        let storage = Self { pool };
        storage.init_schema(true).await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Uses a single pinned connection; each SQLite connection has its own
    /// private memory database.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;

        let storage = Self { pool };
        storage.init_schema(false).await?;
        Ok(storage)
    }

    /// Create tables and, for files, enable WAL mode.
    async fn init_schema(&self, wal: bool) -> Result<(), IndexerError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(storage)?;
        }
        Ok(())
    }

    async fn count(&self, sql: &str) -> Result<u64, IndexerError> {
        let n: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(n as u64)
    }

    async fn transactions_where(
        &self,
        clause: &str,
        binds: &[TxBind<'_>],
    ) -> Result<Vec<TransactionRecord>, IndexerError> {
        let sql = format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE {clause} ORDER BY block_height, log_index"
        );
        let mut query = sqlx::query(&sql);
        for b in binds {
            query = match b {
                TxBind::Text(s) => query.bind(*s),
                TxBind::Int(i) => query.bind(*i),
            };
        }
        let rows = query.fetch_all(&self.pool).await.map_err(storage)?;
        rows.iter().map(transaction_from_row).collect()
    }
}

enum TxBind<'a> {
    Text(&'a str),
    Int(i64),
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn block_from_row(r: &SqliteRow) -> Result<BlockRecord, IndexerError> {
    Ok(BlockRecord {
        height: r.try_get::<i64, _>("height").map_err(storage)? as u64,
        hash: r.try_get("hash").map_err(storage)?,
        timestamp: r.try_get("timestamp").map_err(storage)?,
        processed: r.try_get::<i64, _>("processed").map_err(storage)? != 0,
    })
}

fn participant_from_row(r: &SqliteRow) -> Result<Participant, IndexerError> {
    let role_code = r.try_get::<i64, _>("role_code").map_err(storage)? as u8;
    Ok(Participant {
        address: r.try_get("address").map_err(storage)?,
        name: r.try_get("name").map_err(storage)?,
        role: Role::from_code(role_code),
        role_code,
        metadata: r.try_get("metadata").map_err(storage)?,
        first_seen_height: r.try_get::<i64, _>("first_seen_height").map_err(storage)? as u64,
        last_updated_height: r.try_get::<i64, _>("last_updated_height").map_err(storage)? as u64,
    })
}

fn item_from_row(r: &SqliteRow) -> Result<Item, IndexerError> {
    Ok(Item {
        barcode: r.try_get("barcode").map_err(storage)?,
        name: r.try_get("name").map_err(storage)?,
        manufacturer_name: r.try_get("manufacturer_name").map_err(storage)?,
        manufactured_label: r.try_get("manufactured_label").map_err(storage)?,
        creator: r.try_get("creator").map_err(storage)?,
        initial_volume: r.try_get::<i64, _>("initial_volume").map_err(storage)? as u64,
        created_height: r.try_get::<i64, _>("created_height").map_err(storage)? as u64,
        created_log_index: r.try_get::<i64, _>("created_log_index").map_err(storage)? as u32,
        created_tx_hash: r.try_get("created_tx_hash").map_err(storage)?,
    })
}

fn inventory_from_row(r: &SqliteRow) -> Result<InventoryEntry, IndexerError> {
    Ok(InventoryEntry {
        holder: r.try_get("holder").map_err(storage)?,
        barcode: r.try_get("barcode").map_err(storage)?,
        volume: r.try_get::<i64, _>("volume").map_err(storage)? as u64,
        last_updated_height: r.try_get::<i64, _>("last_updated_height").map_err(storage)? as u64,
    })
}

fn transaction_from_row(r: &SqliteRow) -> Result<TransactionRecord, IndexerError> {
    let kind: String = r.try_get("kind").map_err(storage)?;
    Ok(TransactionRecord {
        kind: EventKind::parse(&kind)
            .ok_or_else(|| IndexerError::Storage(format!("unknown transaction kind {kind:?}")))?,
        barcode: r.try_get("barcode").map_err(storage)?,
        from: r.try_get("from_address").map_err(storage)?,
        to: r.try_get("to_address").map_err(storage)?,
        volume: r.try_get::<i64, _>("volume").map_err(storage)? as u64,
        block_height: r.try_get::<i64, _>("block_height").map_err(storage)? as u64,
        log_index: r.try_get::<i64, _>("log_index").map_err(storage)? as u32,
        tx_hash: r.try_get("tx_hash").map_err(storage)?,
        timestamp: r.try_get("block_timestamp").map_err(storage)?,
        transfer_time: r
            .try_get::<Option<i64>, _>("transfer_time")
            .map_err(storage)?
            .map(|t| t as u64),
    })
}

// ─── ProjectionReader impl ───────────────────────────────────────────────────

#[async_trait]
impl ProjectionReader for SqliteStorage {
    async fn cursor(&self) -> Result<Option<u64>, IndexerError> {
        let stored: Option<i64> = sqlx::query_scalar("SELECT height FROM scan_cursor WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        if let Some(h) = stored {
            return Ok(Some(h as u64));
        }
        // Recoverable from the block table if the cursor row is missing.
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(height) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(max.map(|h| h as u64))
    }

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>, IndexerError> {
        let row = sqlx::query("SELECT height, hash, timestamp, processed FROM blocks WHERE height = ?")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<BlockRecord>, IndexerError> {
        let rows = sqlx::query(
            "SELECT height, hash, timestamp, processed FROM blocks
             WHERE height >= ? AND height <= ? ORDER BY height",
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn participant(&self, address: &str) -> Result<Option<Participant>, IndexerError> {
        let row = sqlx::query("SELECT * FROM participants WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(participant_from_row).transpose()
    }

    async fn participants(&self) -> Result<Vec<Participant>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM participants ORDER BY address")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(participant_from_row).collect()
    }

    async fn item(&self, barcode: &str) -> Result<Option<Item>, IndexerError> {
        let row = sqlx::query("SELECT * FROM items WHERE barcode = ?")
            .bind(barcode)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn inventory_of(&self, holder: &str) -> Result<Vec<InventoryEntry>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM inventory WHERE holder = ? ORDER BY barcode")
            .bind(holder)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(inventory_from_row).collect()
    }

    async fn holders_of(&self, barcode: &str) -> Result<Vec<InventoryEntry>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM inventory WHERE barcode = ? ORDER BY holder")
            .bind(barcode)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(inventory_from_row).collect()
    }

    async fn history(&self, barcode: &str) -> Result<Vec<TransactionRecord>, IndexerError> {
        self.transactions_where("barcode = ?", &[TxBind::Text(barcode)])
            .await
    }

    async fn holder_transactions(
        &self,
        holder: &str,
        up_to: u64,
    ) -> Result<Vec<TransactionRecord>, IndexerError> {
        self.transactions_where(
            "(to_address = ? OR from_address = ?) AND block_height <= ?",
            &[TxBind::Text(holder), TxBind::Text(holder), TxBind::Int(up_to as i64)],
        )
        .await
    }

    async fn transactions_in_block(
        &self,
        height: u64,
    ) -> Result<Vec<TransactionRecord>, IndexerError> {
        self.transactions_where("block_height = ?", &[TxBind::Int(height as i64)])
            .await
    }

    async fn participant_count(&self) -> Result<u64, IndexerError> {
        self.count("SELECT COUNT(*) FROM participants").await
    }

    async fn item_count(&self) -> Result<u64, IndexerError> {
        self.count("SELECT COUNT(*) FROM items").await
    }

    async fn transaction_count(&self) -> Result<u64, IndexerError> {
        self.count("SELECT COUNT(*) FROM transactions").await
    }

    async fn total_volume(&self) -> Result<u64, IndexerError> {
        // Summed as 32-bit halves so SQLite's signed SUM cannot overflow.
        let (high, low): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(volume >> 32), 0), COALESCE(SUM(volume & 4294967295), 0)
             FROM inventory",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        let total = ((high as u128) << 32) + low as u128;
        u64::try_from(total)
            .map_err(|_| IndexerError::Storage("total inventory volume overflows u64".into()))
    }

    async fn active_participant_count(&self) -> Result<u64, IndexerError> {
        self.count(
            "SELECT COUNT(*) FROM participants p WHERE EXISTS (
                SELECT 1 FROM transactions t
                WHERE t.to_address = p.address OR t.from_address = p.address
            )",
        )
        .await
    }
}

// ─── ProjectionStore impl ────────────────────────────────────────────────────

#[async_trait]
impl ProjectionStore for SqliteStorage {
    async fn snapshot(&self, keys: &SnapshotKeys) -> Result<StateSnapshot, IndexerError> {
        let mut snapshot = StateSnapshot::default();
        for address in &keys.participants {
            if let Some(p) = self.participant(address).await? {
                snapshot.participants.insert(address.clone(), p);
            }
        }
        for barcode in &keys.barcodes {
            if let Some(item) = self.item(barcode).await? {
                snapshot.items.insert(barcode.clone(), item);
            }
        }
        for (holder, barcode) in &keys.inventory {
            let volume: Option<i64> =
                sqlx::query_scalar("SELECT volume FROM inventory WHERE holder = ? AND barcode = ?")
                    .bind(holder)
                    .bind(barcode)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage)?;
            if let Some(v) = volume {
                snapshot
                    .inventory
                    .insert((holder.clone(), barcode.clone()), v as u64);
            }
        }
        let recorded: Vec<i64> =
            sqlx::query_scalar("SELECT log_index FROM transactions WHERE block_height = ?")
                .bind(keys.block_height as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
        snapshot.recorded = recorded.into_iter().map(|i| i as u32).collect();
        Ok(snapshot)
    }

    async fn commit_block(&self, batch: BlockBatch) -> Result<(), IndexerError> {
        let writes = batch.into_writes();
        writes.check_volumes()?;
        let height = writes.block.height as i64;
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Compare-and-update: every inventory row must still hold what the batch read.
        for w in &writes.inventory {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT volume FROM inventory WHERE holder = ? AND barcode = ?")
                    .bind(&w.holder)
                    .bind(&w.barcode)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage)?;
            let actual = actual.unwrap_or(0) as u64;
            if actual != w.expected {
                return Err(IndexerError::StaleInventory {
                    holder: w.holder.clone(),
                    barcode: w.barcode.clone(),
                    expected: w.expected,
                    actual,
                });
            }
        }

        for p in &writes.participants {
            sqlx::query(
                "INSERT INTO participants
                 (address, name, role_code, metadata, first_seen_height, last_updated_height)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (address) DO UPDATE SET
                    name = excluded.name,
                    role_code = excluded.role_code,
                    metadata = excluded.metadata,
                    first_seen_height = MIN(participants.first_seen_height, excluded.first_seen_height),
                    last_updated_height = excluded.last_updated_height",
            )
            .bind(&p.address)
            .bind(&p.name)
            .bind(p.role_code as i64)
            .bind(&p.metadata)
            .bind(p.first_seen_height as i64)
            .bind(p.last_updated_height as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        for item in &writes.items {
            sqlx::query(
                "INSERT OR IGNORE INTO items
                 (barcode, name, manufacturer_name, manufactured_label, creator,
                  initial_volume, created_height, created_log_index, created_tx_hash)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&item.barcode)
            .bind(&item.name)
            .bind(&item.manufacturer_name)
            .bind(&item.manufactured_label)
            .bind(&item.creator)
            .bind(item.initial_volume as i64)
            .bind(item.created_height as i64)
            .bind(item.created_log_index as i64)
            .bind(&item.created_tx_hash)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        for w in &writes.inventory {
            sqlx::query(
                "INSERT INTO inventory (holder, barcode, volume, last_updated_height)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (holder, barcode) DO UPDATE SET
                    volume = excluded.volume,
                    last_updated_height = excluded.last_updated_height",
            )
            .bind(&w.holder)
            .bind(&w.barcode)
            .bind(w.volume as i64)
            .bind(height)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        let mut appended = 0u64;
        for t in &writes.transactions {
            let sql = format!(
                "INSERT OR IGNORE INTO transactions ({TX_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            let done = sqlx::query(&sql)
                .bind(t.kind.as_str())
                .bind(&t.barcode)
                .bind(&t.from)
                .bind(&t.to)
                .bind(t.volume as i64)
                .bind(t.block_height as i64)
                .bind(t.log_index as i64)
                .bind(&t.tx_hash)
                .bind(t.timestamp)
                .bind(t.transfer_time.map(|v| v as i64))
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            appended += done.rows_affected();
        }

        sqlx::query(
            "INSERT OR REPLACE INTO blocks (height, hash, timestamp, processed) VALUES (?, ?, ?, ?)",
        )
        .bind(height)
        .bind(&writes.block.hash)
        .bind(writes.block.timestamp)
        .bind(writes.block.processed as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            "INSERT INTO scan_cursor (id, height) VALUES (0, ?)
             ON CONFLICT (id) DO UPDATE SET height = MAX(scan_cursor.height, excluded.height)",
        )
        .bind(height)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        debug!(block = height, appended, "block committed (sqlite)");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
