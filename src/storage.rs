// src/storage.rs
//
// Reading persistence. One table per partition: three "live" partitions
// that collect readings while no session is active, plus three per
// session (`telemetry_<id>`, `multimeter_<id>`, `oscilloscope_<id>`).
// Each row keeps the capture timestamp and the reading's JSON envelope.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use crate::io::{DeviceKind, Reading};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown partition '{0}'")]
    UnknownPartition(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Names one storage partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionHandle {
    pub kind: DeviceKind,
    /// None for the live partition
    pub session_id: Option<u64>,
}

impl PartitionHandle {
    pub fn live(kind: DeviceKind) -> Self {
        Self { kind, session_id: None }
    }

    pub fn session(session_id: u64, kind: DeviceKind) -> Self {
        Self { kind, session_id: Some(session_id) }
    }

    /// Table name. Built only from fixed prefixes and an integer.
    pub fn name(&self) -> String {
        match self.session_id {
            Some(id) => format!("{}_{}", self.kind.partition_prefix(), id),
            None => format!("{}_live", self.kind.partition_prefix()),
        }
    }
}

impl std::fmt::Display for PartitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// A stored reading as read back from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub timestamp_us: u64,
    pub document: serde_json::Value,
}

/// Persistence backend shared by the session manager and the recorder.
pub trait StorageEngine: Send + Sync {
    fn append(&self, partition: &PartitionHandle, reading: &Reading) -> Result<(), StorageError>;
    fn create_partition(&self, session_id: u64, kind: DeviceKind) -> Result<PartitionHandle, StorageError>;
    fn drop_partition(&self, partition: &PartitionHandle) -> Result<(), StorageError>;
    /// One past the highest existing session id; 1 when there are none.
    fn next_session_id(&self) -> Result<u64, StorageError>;
    /// Move every live row into the given session's partitions. Returns rows moved.
    fn move_live_rows(&self, session_id: u64) -> Result<usize, StorageError>;
    fn latest(&self, partition: &PartitionHandle) -> Result<Option<StoredRow>, StorageError>;
    fn count(&self, partition: &PartitionHandle) -> Result<u64, StorageError>;
    fn list_sessions(&self) -> Result<Vec<u64>, StorageError>;
    /// Drop every session partition and empty the live ones.
    fn reset(&self) -> Result<(), StorageError>;
}

/// Parse `<prefix>_<digits>` into a session id.
fn session_id_from_name(name: &str) -> Option<u64> {
    DeviceKind::ALL.iter().find_map(|kind| {
        name.strip_prefix(kind.partition_prefix())
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse().ok())
    })
}

// ============================================================================
// SQLite
// ============================================================================

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database and its live partitions.
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create data dir: {}", e))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| format!("Failed to open database: {}", e))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| format!("Failed to set WAL mode: {}", e))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")
            .map_err(|e| format!("Failed to set synchronous mode: {}", e))?;

        for kind in DeviceKind::ALL {
            create_table(&conn, &PartitionHandle::live(kind).name())
                .map_err(|e| format!("Failed to create live partition: {}", e))?;
        }

        tlog!("[storage] Opened {:?}", path);
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("connection lock poisoned".into()))
    }
}

fn create_table(conn: &Connection, name: &str) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            rowid INTEGER PRIMARY KEY,
            timestamp_us INTEGER NOT NULL,
            document TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{name}_ts ON {name} (timestamp_us);"
    ))
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn require_table(conn: &Connection, partition: &PartitionHandle) -> Result<String, StorageError> {
    let name = partition.name();
    if table_exists(conn, &name)? {
        Ok(name)
    } else {
        Err(StorageError::UnknownPartition(name))
    }
}

fn row_to_stored(row: &rusqlite::Row) -> rusqlite::Result<(i64, String)> {
    Ok((row.get("timestamp_us")?, row.get("document")?))
}

impl StorageEngine for SqliteStorage {
    fn append(&self, partition: &PartitionHandle, reading: &Reading) -> Result<(), StorageError> {
        let document = serde_json::to_string(&reading.to_envelope())?;
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "INSERT INTO {} (timestamp_us, document) VALUES (?1, ?2)",
                partition.name()
            ))
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(_, Some(ref msg)) if msg.contains("no such table") => {
                    StorageError::UnknownPartition(partition.name())
                }
                other => StorageError::Sqlite(other),
            })?;
        stmt.execute(params![reading.timestamp_us as i64, document])?;
        Ok(())
    }

    fn create_partition(&self, session_id: u64, kind: DeviceKind) -> Result<PartitionHandle, StorageError> {
        let partition = PartitionHandle::session(session_id, kind);
        let conn = self.lock()?;
        create_table(&conn, &partition.name())?;
        Ok(partition)
    }

    fn drop_partition(&self, partition: &PartitionHandle) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", partition.name()))?;
        Ok(())
    }

    fn next_session_id(&self) -> Result<u64, StorageError> {
        Ok(self.list_sessions()?.last().map(|max| max + 1).unwrap_or(1))
    }

    fn move_live_rows(&self, session_id: u64) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut moved = 0;
        for kind in DeviceKind::ALL {
            let live = PartitionHandle::live(kind).name();
            let target = require_table(&tx, &PartitionHandle::session(session_id, kind))?;
            moved += tx.execute(
                &format!(
                    "INSERT INTO {target} (timestamp_us, document)
                     SELECT timestamp_us, document FROM {live} ORDER BY rowid"
                ),
                [],
            )?;
            tx.execute(&format!("DELETE FROM {live}"), [])?;
        }
        tx.commit()?;
        Ok(moved)
    }

    fn latest(&self, partition: &PartitionHandle) -> Result<Option<StoredRow>, StorageError> {
        let conn = self.lock()?;
        let name = require_table(&conn, partition)?;
        let row = conn
            .query_row(
                &format!("SELECT timestamp_us, document FROM {name} ORDER BY rowid DESC LIMIT 1"),
                [],
                row_to_stored,
            )
            .optional()?;
        match row {
            Some((timestamp_us, document)) => Ok(Some(StoredRow {
                timestamp_us: timestamp_us as u64,
                document: serde_json::from_str(&document)?,
            })),
            None => Ok(None),
        }
    }

    fn count(&self, partition: &PartitionHandle) -> Result<u64, StorageError> {
        let conn = self.lock()?;
        let name = require_table(&conn, partition)?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn list_sessions(&self) -> Result<Vec<u64>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut ids: Vec<u64> = names.iter().filter_map(|n| session_id_from_name(n)).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn reset(&self) -> Result<(), StorageError> {
        let sessions = self.list_sessions()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for id in sessions {
            for kind in DeviceKind::ALL {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", PartitionHandle::session(id, kind)))?;
            }
        }
        for kind in DeviceKind::ALL {
            tx.execute(&format!("DELETE FROM {}", PartitionHandle::live(kind)), [])?;
        }
        tx.commit()?;
        tlog!("[storage] Reset: all session partitions dropped");
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<StoredRow>>,
    failing_kind: Option<DeviceKind>,
    fail_appends: bool,
}

/// Storage kept in process memory. Supports fault injection for tests.
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        for kind in DeviceKind::ALL {
            state.tables.insert(PartitionHandle::live(kind).name(), Vec::new());
        }
        Self { state: Mutex::new(state) }
    }

    /// Make `create_partition` fail for one device kind (None clears it).
    pub fn fail_partition_creation(&self, kind: Option<DeviceKind>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_kind = kind;
        }
    }

    pub fn fail_appends(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_appends = fail;
        }
    }

    pub fn has_partition(&self, partition: &PartitionHandle) -> bool {
        self.state
            .lock()
            .map(|state| state.tables.contains_key(&partition.name()))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("state lock poisoned".into()))
    }
}

impl StorageEngine for MemoryStorage {
    fn append(&self, partition: &PartitionHandle, reading: &Reading) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.fail_appends {
            return Err(StorageError::Backend("injected append failure".into()));
        }
        let rows = state
            .tables
            .get_mut(&partition.name())
            .ok_or_else(|| StorageError::UnknownPartition(partition.name()))?;
        rows.push(StoredRow {
            timestamp_us: reading.timestamp_us,
            document: reading.to_envelope(),
        });
        Ok(())
    }

    fn create_partition(&self, session_id: u64, kind: DeviceKind) -> Result<PartitionHandle, StorageError> {
        let mut state = self.lock()?;
        if state.failing_kind == Some(kind) {
            return Err(StorageError::Backend(format!("injected failure creating {} partition", kind)));
        }
        let partition = PartitionHandle::session(session_id, kind);
        state.tables.entry(partition.name()).or_default();
        Ok(partition)
    }

    fn drop_partition(&self, partition: &PartitionHandle) -> Result<(), StorageError> {
        self.lock()?.tables.remove(&partition.name());
        Ok(())
    }

    fn next_session_id(&self) -> Result<u64, StorageError> {
        Ok(self.list_sessions()?.last().map(|max| max + 1).unwrap_or(1))
    }

    fn move_live_rows(&self, session_id: u64) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        for kind in DeviceKind::ALL {
            let target = PartitionHandle::session(session_id, kind).name();
            if !state.tables.contains_key(&target) {
                return Err(StorageError::UnknownPartition(target));
            }
        }
        let mut moved = 0;
        for kind in DeviceKind::ALL {
            let rows = state
                .tables
                .get_mut(&PartitionHandle::live(kind).name())
                .map(std::mem::take)
                .unwrap_or_default();
            moved += rows.len();
            if let Some(target) = state.tables.get_mut(&PartitionHandle::session(session_id, kind).name()) {
                target.extend(rows);
            }
        }
        Ok(moved)
    }

    fn latest(&self, partition: &PartitionHandle) -> Result<Option<StoredRow>, StorageError> {
        let state = self.lock()?;
        let rows = state
            .tables
            .get(&partition.name())
            .ok_or_else(|| StorageError::UnknownPartition(partition.name()))?;
        Ok(rows.last().cloned())
    }

    fn count(&self, partition: &PartitionHandle) -> Result<u64, StorageError> {
        let state = self.lock()?;
        state
            .tables
            .get(&partition.name())
            .map(|rows| rows.len() as u64)
            .ok_or_else(|| StorageError::UnknownPartition(partition.name()))
    }

    fn list_sessions(&self) -> Result<Vec<u64>, StorageError> {
        let state = self.lock()?;
        let mut ids: Vec<u64> = state.tables.keys().filter_map(|n| session_id_from_name(n)).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn reset(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.tables.retain(|name, _| session_id_from_name(name).is_none());
        state.tables.values_mut().for_each(Vec::clear);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
