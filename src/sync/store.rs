//! The durable local patch log.
//!
//! SQLite-backed: `patches` (the per-session causal chains), `pending_patches`
//! (appended but not yet remote-acknowledged), `heads` ("local"/"remote"),
//! `snapshots` (opportunistic replay checkpoints), and `meta` (client id,
//! session counter). The append path — patch row, pending mark, local head —
//! is one transaction, so a crash never leaves a head pointing at a missing
//! patch or an acknowledged patch still marked pending.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;

use crate::core::{ClientId, PatchKey, PatchOp, PatchRecord, PatchSeq, SessionId};
use crate::error::{Effect, Transience};

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store corrupt: {reason}")]
    Corrupt { reason: String },

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("patch not found: {0:?}")]
    PatchNotFound(PatchKey),

    #[error("unsupported store schema version {found} (supported {supported})")]
    UnsupportedSchema { found: i64, supported: i64 },
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Sqlite(_) => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            StoreError::Sqlite(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable log handle. The connection is mutex-wrapped: the engine thread,
/// the log thread and the push thread all hold the same store.
pub struct PatchStore {
    conn: Mutex<Connection>,
}

impl PatchStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::bootstrap(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS patches (
                 client_id         INTEGER NOT NULL,
                 session_id        INTEGER NOT NULL,
                 patch_id          INTEGER NOT NULL,
                 parent_client_id  INTEGER NOT NULL,
                 parent_session_id INTEGER NOT NULL,
                 parent_patch_id   INTEGER NOT NULL,
                 forward           TEXT NOT NULL,
                 reverse           TEXT NOT NULL,
                 created_at        INTEGER NOT NULL,
                 PRIMARY KEY (client_id, session_id, patch_id)
             );
             CREATE TABLE IF NOT EXISTS pending_patches (
                 client_id  INTEGER NOT NULL,
                 session_id INTEGER NOT NULL,
                 patch_id   INTEGER NOT NULL,
                 PRIMARY KEY (client_id, session_id, patch_id)
             );
             CREATE TABLE IF NOT EXISTS heads (
                 name       TEXT PRIMARY KEY,
                 client_id  INTEGER NOT NULL,
                 session_id INTEGER NOT NULL,
                 patch_id   INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS snapshots (
                 client_id  INTEGER NOT NULL,
                 session_id INTEGER NOT NULL,
                 patch_id   INTEGER NOT NULL,
                 snapshot   TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 PRIMARY KEY (client_id, session_id, patch_id)
             );",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        match store.meta_i64("schema_version")? {
            None => store.set_meta_i64("schema_version", SCHEMA_VERSION)?,
            Some(SCHEMA_VERSION) => {}
            Some(found) => {
                return Err(StoreError::UnsupportedSchema {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
        }
        Ok(store)
    }

    fn meta_i64(&self, key: &str) -> StoreResult<Option<i64>> {
        let conn = self.conn.lock().expect("store mutex");
        let value: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        match value {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| StoreError::Corrupt {
                reason: format!("meta {key} is not an integer: {raw:?}"),
            }),
        }
    }

    fn set_meta_i64(&self, key: &str, value: i64) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    pub fn client_id(&self) -> StoreResult<Option<ClientId>> {
        Ok(self.meta_i64("client_id")?.map(ClientId))
    }

    pub fn set_client_id(&self, client_id: ClientId) -> StoreResult<()> {
        self.set_meta_i64("client_id", client_id.0)
    }

    /// Allocate the next session id. One increment per store open; the
    /// read-increment-write runs in its own transaction so two opens can
    /// never share a session.
    pub fn next_session_id(&self) -> StoreResult<SessionId> {
        let mut conn = self.conn.lock().expect("store mutex");
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM meta WHERE key = 'session_seq'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let next = match current {
            None => 1,
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::Corrupt {
                reason: format!("meta session_seq is not an integer: {raw:?}"),
            })? + 1,
        };
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('session_seq', ?1)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            [next.to_string()],
        )?;
        tx.commit()?;
        Ok(SessionId(next))
    }

    /// Append a locally produced patch: patch row + pending mark + local
    /// head advance, all or nothing.
    pub fn append_local(&self, record: &PatchRecord) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store mutex");
        let tx = conn.transaction()?;
        insert_patch(&tx, record)?;
        tx.execute(
            "INSERT OR REPLACE INTO pending_patches (client_id, session_id, patch_id)
             VALUES (?1, ?2, ?3)",
            key_params(&record.key),
        )?;
        put_head(&tx, "local", &record.key)?;
        tx.commit()?;
        Ok(())
    }

    /// Store patches fetched from the remote (no pending mark, no head
    /// movement).
    pub fn store_remote_patches(&self, records: &[PatchRecord]) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store mutex");
        let tx = conn.transaction()?;
        for record in records {
            insert_patch(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn head(&self, name: &str) -> StoreResult<Option<PatchKey>> {
        let conn = self.conn.lock().expect("store mutex");
        conn.query_row(
            "SELECT client_id, session_id, patch_id FROM heads WHERE name = ?1",
            [name],
            |row| {
                Ok(PatchKey::new(
                    ClientId(row.get(0)?),
                    SessionId(row.get(1)?),
                    PatchSeq(row.get(2)?),
                ))
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_head(&self, name: &str, key: &PatchKey) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex");
        put_head(&conn, name, key)?;
        Ok(())
    }

    /// Set both heads in one transaction (bootstrap, adopt-remote).
    pub fn set_heads(&self, key: &PatchKey) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store mutex");
        let tx = conn.transaction()?;
        put_head(&tx, "local", key)?;
        put_head(&tx, "remote", key)?;
        tx.commit()?;
        Ok(())
    }

    /// Oldest pending keys, up to `limit`, in append order.
    pub fn pending_page(&self, limit: usize) -> StoreResult<Vec<PatchKey>> {
        let conn = self.conn.lock().expect("store mutex");
        let mut stmt = conn.prepare(
            "SELECT client_id, session_id, patch_id FROM pending_patches
             ORDER BY client_id, session_id, patch_id
             LIMIT ?1",
        )?;
        let keys = stmt
            .query_map([limit as i64], |row| {
                Ok(PatchKey::new(
                    ClientId(row.get(0)?),
                    SessionId(row.get(1)?),
                    PatchSeq(row.get(2)?),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn pending_count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().expect("store mutex");
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_patches", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn remove_pending(&self, keys: &[PatchKey]) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store mutex");
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute(
                "DELETE FROM pending_patches
                 WHERE client_id = ?1 AND session_id = ?2 AND patch_id = ?3",
                key_params(key),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read_patch(&self, key: &PatchKey) -> StoreResult<PatchRecord> {
        let conn = self.conn.lock().expect("store mutex");
        read_patch(&conn, key)
    }

    pub fn read_patches(&self, keys: &[PatchKey]) -> StoreResult<Vec<PatchRecord>> {
        let conn = self.conn.lock().expect("store mutex");
        keys.iter().map(|key| read_patch(&conn, key)).collect()
    }

    pub fn write_snapshot(&self, key: &PatchKey, snapshot: &Value, now_ms: u64) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT OR REPLACE INTO snapshots
                 (client_id, session_id, patch_id, snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.client_id.0,
                key.session_id.0,
                key.patch_id.0,
                serde_json::to_string(snapshot)?,
                now_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn snapshot_at(&self, key: &PatchKey) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock().expect("store mutex");
        let raw: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM snapshots
                 WHERE client_id = ?1 AND session_id = ?2 AND patch_id = ?3",
                key_params(key),
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    /// Walk the causal chain from `head` back to the nearest snapshot or the
    /// chain root. Returns the base document and the patches to apply, in
    /// application (oldest-first) order.
    pub fn load_chain(&self, head: &PatchKey) -> StoreResult<(Value, Vec<PatchRecord>)> {
        let conn = self.conn.lock().expect("store mutex");
        let mut patches = Vec::new();
        let mut cursor = *head;
        loop {
            if let Some(raw) = conn
                .query_row(
                    "SELECT snapshot FROM snapshots
                     WHERE client_id = ?1 AND session_id = ?2 AND patch_id = ?3",
                    key_params(&cursor),
                    |row| row.get::<_, String>(0),
                )
                .optional()?
            {
                patches.reverse();
                return Ok((serde_json::from_str(&raw)?, patches));
            }
            let record = read_patch(&conn, &cursor)?;
            let parent = record.parent;
            let is_root = record.is_chain_root();
            patches.push(record);
            if is_root {
                patches.reverse();
                return Ok((Value::Null, patches));
            }
            cursor = parent;
        }
    }
}

fn key_params(key: &PatchKey) -> [i64; 3] {
    [key.client_id.0, key.session_id.0, key.patch_id.0]
}

fn put_head(conn: &Connection, name: &str, key: &PatchKey) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO heads (name, client_id, session_id, patch_id)
         VALUES (?1, ?2, ?3, ?4)",
        params![name, key.client_id.0, key.session_id.0, key.patch_id.0],
    )?;
    Ok(())
}

fn insert_patch(conn: &Connection, record: &PatchRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO patches
             (client_id, session_id, patch_id,
              parent_client_id, parent_session_id, parent_patch_id,
              forward, reverse, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.key.client_id.0,
            record.key.session_id.0,
            record.key.patch_id.0,
            record.parent.client_id.0,
            record.parent.session_id.0,
            record.parent.patch_id.0,
            serde_json::to_string(&record.forward)?,
            serde_json::to_string(&record.reverse)?,
            record.created_at as i64,
        ],
    )?;
    Ok(())
}

fn read_patch(conn: &Connection, key: &PatchKey) -> StoreResult<PatchRecord> {
    let row = conn
        .query_row(
            "SELECT parent_client_id, parent_session_id, parent_patch_id,
                    forward, reverse, created_at
             FROM patches
             WHERE client_id = ?1 AND session_id = ?2 AND patch_id = ?3",
            key_params(key),
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((pc, ps, pp, forward, reverse, created_at)) = row else {
        return Err(StoreError::PatchNotFound(*key));
    };
    let forward: Vec<PatchOp> = serde_json::from_str(&forward)?;
    let reverse: Vec<PatchOp> = serde_json::from_str(&reverse)?;
    Ok(PatchRecord {
        key: *key,
        parent: PatchKey::new(ClientId(pc), SessionId(ps), PatchSeq(pp)),
        forward,
        reverse,
        created_at: created_at as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(client: i64, session: i64, patch: i64) -> PatchKey {
        PatchKey::new(ClientId(client), SessionId(session), PatchSeq(patch))
    }

    fn record(k: PatchKey, parent: PatchKey) -> PatchRecord {
        PatchRecord {
            key: k,
            parent,
            forward: vec![PatchOp::replace("/id_seq", json!(k.patch_id.0))],
            reverse: vec![PatchOp::replace("/id_seq", json!(k.patch_id.0 - 1))],
            created_at: 1_000 + k.patch_id.0 as u64,
        }
    }

    #[test]
    fn append_is_atomic_and_advances_the_head() {
        let store = PatchStore::open_in_memory().unwrap();
        let root = key(1, 1, 0);
        store.append_local(&record(root, root)).unwrap();
        store.append_local(&record(key(1, 1, 1), root)).unwrap();

        assert_eq!(store.head("local").unwrap(), Some(key(1, 1, 1)));
        assert_eq!(store.pending_count().unwrap(), 2);
        let page = store.pending_page(10).unwrap();
        assert_eq!(page, vec![root, key(1, 1, 1)]);
    }

    #[test]
    fn remove_pending_leaves_patches_behind() {
        let store = PatchStore::open_in_memory().unwrap();
        let root = key(1, 1, 0);
        store.append_local(&record(root, root)).unwrap();
        store.remove_pending(&[root]).unwrap();
        assert_eq!(store.pending_count().unwrap(), 0);
        assert!(store.read_patch(&root).is_ok());
    }

    #[test]
    fn load_chain_walks_to_the_root() {
        let store = PatchStore::open_in_memory().unwrap();
        let root = key(1, 1, 0);
        store.append_local(&record(root, root)).unwrap();
        store.append_local(&record(key(1, 1, 1), root)).unwrap();
        store.append_local(&record(key(1, 1, 2), key(1, 1, 1))).unwrap();

        let (base, patches) = store.load_chain(&key(1, 1, 2)).unwrap();
        assert_eq!(base, Value::Null);
        let ids: Vec<i64> = patches.iter().map(|p| p.key.patch_id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn load_chain_stops_at_a_snapshot() {
        let store = PatchStore::open_in_memory().unwrap();
        let root = key(1, 1, 0);
        store.append_local(&record(root, root)).unwrap();
        store.append_local(&record(key(1, 1, 1), root)).unwrap();
        store
            .write_snapshot(&key(1, 1, 1), &json!({"restored": true}), 99)
            .unwrap();
        store.append_local(&record(key(1, 1, 2), key(1, 1, 1))).unwrap();

        let (base, patches) = store.load_chain(&key(1, 1, 2)).unwrap();
        assert_eq!(base, json!({"restored": true}));
        let ids: Vec<i64> = patches.iter().map(|p| p.key.patch_id.0).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn missing_chain_link_is_an_error() {
        let store = PatchStore::open_in_memory().unwrap();
        let err = store.load_chain(&key(1, 1, 5)).unwrap_err();
        assert!(matches!(err, StoreError::PatchNotFound(_)));
    }

    #[test]
    fn session_ids_increment_per_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("braid.db");
        {
            let store = PatchStore::open(&path).unwrap();
            assert_eq!(store.next_session_id().unwrap(), SessionId(1));
        }
        {
            let store = PatchStore::open(&path).unwrap();
            assert_eq!(store.next_session_id().unwrap(), SessionId(2));
            store.set_client_id(ClientId(7)).unwrap();
        }
        let store = PatchStore::open(&path).unwrap();
        assert_eq!(store.client_id().unwrap(), Some(ClientId(7)));
    }
}
