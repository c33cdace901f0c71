use crate::{RecordStore, StorageCommand, dec_backlog, inc_backlog, set_last_flush};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::oneshot;

use telemux_common::threading::{ThreadHandle, ThreadRegistry};
use telemux_core::error::PersistenceError;
use telemux_core::records::{Category, PersistedRecord, SubRecord};

/// SQLite-backed store. All statements run on one writer thread that owns
/// the connection; async callers talk to it over a channel.
pub struct SqliteStore {
    db_path: PathBuf,
    sender: Sender<StorageCommand>,
    writer_thread: Mutex<Option<ThreadHandle>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P, threads: &ThreadRegistry) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open SQLite database {:?}", db_path))?;
        Self::init_db(&conn)?;
        drop(conn);

        let (sender, receiver) = crossbeam_channel::unbounded();
        let db_path_clone = db_path.clone();
        let writer_thread = threads.spawn("sqlite-writer", move || {
            Self::background_writer(db_path_clone, receiver);
        })?;

        Ok(Self {
            db_path,
            sender,
            writer_thread: Mutex::new(Some(writer_thread)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_db(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        for category in Category::ALL {
            let columns: String = category
                .fields()
                .iter()
                .map(|f| format!(",\n                {f} REAL NOT NULL"))
                .collect();
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')){columns}
            );",
                table = category.table_name(),
            );
            conn.execute_batch(&ddl)
                .with_context(|| format!("Failed to create table {}", category.table_name()))?;
        }
        Ok(())
    }

    fn background_writer(db_path: PathBuf, receiver: Receiver<StorageCommand>) {
        info!("SQLite writer thread started for {:?}", db_path);
        let conn = match Connection::open(&db_path) {
            Ok(conn) => Some(conn),
            Err(e) => {
                error!("SQLite writer failed to open {:?}: {}", db_path, e);
                None
            }
        };

        for command in receiver.iter() {
            match command {
                StorageCommand::Insert { record, reply } => {
                    let result = match &conn {
                        Some(conn) => insert_record(conn, &record)
                            .map_err(|e| PersistenceError::Store(e.to_string())),
                        None => Err(PersistenceError::Unavailable),
                    };
                    if result.is_ok() {
                        set_last_flush(Utc::now());
                    }
                    dec_backlog();
                    let _ = reply.send(result);
                }
                StorageCommand::Recent {
                    category,
                    limit,
                    reply,
                } => {
                    let result = match &conn {
                        Some(conn) => recent_records(conn, category, limit),
                        None => Err(anyhow!("SQLite connection unavailable")),
                    };
                    let _ = reply.send(result);
                }
                StorageCommand::Ping { reply } => {
                    let result = match &conn {
                        Some(conn) => conn
                            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                            .map(|_| ())
                            .context("SQLite ping failed"),
                        None => Err(anyhow!("SQLite connection unavailable")),
                    };
                    let _ = reply.send(result);
                }
                StorageCommand::Shutdown => {
                    info!("SQLite writer received shutdown");
                    break;
                }
            }
        }
        info!("SQLite writer thread exiting");
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> StorageCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| anyhow!("SQLite writer is not running"))?;
        rx.await
            .map_err(|_| anyhow!("SQLite writer dropped the request"))?
    }
}

fn insert_record(conn: &Connection, record: &SubRecord) -> Result<PersistedRecord> {
    let category = record.category();
    let fields = category.fields();
    let placeholders: Vec<String> = (1..=fields.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING id, created_at",
        category.table_name(),
        fields.join(", "),
        placeholders.join(", "),
    );
    let values = record.values();
    let (id, created_at) = conn
        .prepare_cached(&sql)?
        .query_row(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
    debug!("persisted {} as id {}", category, id);
    Ok(PersistedRecord {
        id,
        created_at: parse_timestamp(&created_at)?,
        record: *record,
    })
}

fn recent_records(conn: &Connection, category: Category, limit: usize) -> Result<Vec<PersistedRecord>> {
    let fields = category.fields();
    let sql = format!(
        "SELECT id, created_at, {} FROM {} ORDER BY id DESC LIMIT ?1",
        fields.join(", "),
        category.table_name(),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([limit as i64], |row| {
        let id: i64 = row.get(0)?;
        let created_at: String = row.get(1)?;
        let values = (0..fields.len())
            .map(|i| row.get::<_, f64>(i + 2))
            .collect::<rusqlite::Result<Vec<f64>>>()?;
        Ok((id, created_at, values))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (id, created_at, values) = row?;
        let record = SubRecord::from_values(category, &values)
            .ok_or_else(|| anyhow!("row {} in {} has wrong arity", id, category.table_name()))?;
        records.push(PersistedRecord {
            id,
            created_at: parse_timestamp(&created_at)?,
            record,
        });
    }
    records.reverse();
    Ok(records)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp '{raw}'"))
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite3"
    }

    async fn ping(&self) -> Result<()> {
        self.request(|reply| StorageCommand::Ping { reply }).await
    }

    async fn insert(&self, record: SubRecord) -> Result<PersistedRecord, PersistenceError> {
        let (tx, rx) = oneshot::channel();
        inc_backlog();
        if self
            .sender
            .send(StorageCommand::Insert { record, reply: tx })
            .is_err()
        {
            dec_backlog();
            return Err(PersistenceError::Unavailable);
        }
        rx.await.map_err(|_| PersistenceError::Unavailable)?
    }

    async fn recent(&self, category: Category, limit: usize) -> Result<Vec<PersistedRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.request(|reply| StorageCommand::Recent {
            category,
            limit,
            reply,
        })
        .await
    }

    fn close(&self) {
        let handle = self
            .writer_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = self.sender.send(StorageCommand::Shutdown);
            if handle.join().is_err() {
                error!("SQLite writer thread panicked");
            }
        }
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        let _ = self.sender.send(StorageCommand::Shutdown);
    }
}

/// Used by tests that need to look at a table directly.
pub fn count_rows(db_path: &Path, category: Category) -> Result<i64> {
    let conn = Connection::open(db_path)?;
    let count = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {}", category.table_name()),
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}
