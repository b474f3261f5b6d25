//! State store backed by an embedded SQLite database.
//!
//! Each backend instance owns a private directory with one database
//! file in it. Registered states are column families: a row in the
//! `column_families` catalog plus a `cf_<n>` table holding the rows.
//!
//! Snapshots take a consistent copy of the database with `VACUUM
//! INTO`, stream the copy into the keyed snapshot format and delete
//! it. Both steps run in the synchronous part of a checkpoint, under
//! the checkpoint lock.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use tracing::instrument;

use super::snapshot::write_key_groups;
use super::store::*;
use super::StateKind;
use super::StateMetaInfo;
use crate::errors::Error;
use crate::errors::Result;
use crate::errors::ResultExt;
use crate::model::*;

const DB_FILE_NAME: &str = "state.sqlite3";

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![M::up(
            "CREATE TABLE column_families ( \
             cf_id INTEGER NOT NULL PRIMARY KEY CHECK (cf_id >= 0), \
             name TEXT NOT NULL UNIQUE, \
             kind TEXT NOT NULL CHECK (kind IN ('value', 'list', 'map')) \
             ) STRICT",
        )])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

fn parse_kind(kind: &str) -> Result<StateKind> {
    match kind {
        "value" => Ok(StateKind::Value),
        "list" => Ok(StateKind::List),
        "map" => Ok(StateKind::Map),
        other => Err(Error::corrupt(format!("unknown column family kind {other:?}"))),
    }
}

fn create_cf_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} ( \
         key_group INTEGER NOT NULL CHECK (key_group >= 0), \
         key BLOB NOT NULL, \
         namespace BLOB NOT NULL, \
         user_key BLOB NOT NULL, \
         value BLOB NOT NULL, \
         PRIMARY KEY (key_group, key, namespace, user_key) \
         ) STRICT, WITHOUT ROWID"
    ))?;
    Ok(())
}

fn read_group_rows(conn: &Connection, table: &str, key_group: u32) -> Result<Vec<StateRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT key, namespace, user_key, value \
         FROM {table} \
         WHERE key_group = ?1 \
         ORDER BY key, namespace, user_key"
    ))?;
    // Collect so we don't hold the statement across calls.
    let rows = stmt
        .query_map((key_group,), |row| {
            Ok(StateRow {
                key: row.get(0)?,
                namespace: row.get(1)?,
                user_key: row.get(2)?,
                value: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Keeps state in an on-disk SQLite database.
pub struct SqliteStore {
    dir: PathBuf,
    conn: Connection,
    metas: Vec<StateMetaInfo>,
    tables: HashMap<String, String>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("dir", &self.dir)
            .field("metas", &self.metas)
            .finish()
    }
}

impl SqliteStore {
    /// Open a fresh store in `dir`.
    ///
    /// The directory belongs to this instance alone; anything already
    /// there is left over from an earlier attempt and is removed.
    #[instrument(name = "open_sqlite_store")]
    pub fn open(dir: &Path) -> Result<Self> {
        if dir.exists() {
            tracing::debug!("Removing stale state store directory {dir:?}");
            std::fs::remove_dir_all(dir)
                .reraise_with(|| format!("error clearing state store directory {dir:?}"))?;
        }
        std::fs::create_dir_all(dir)
            .reraise_with(|| format!("error creating state store directory {dir:?}"))?;
        let mut conn = Connection::open(dir.join(DB_FILE_NAME))?;
        setup_conn(&mut conn)?;

        let mut store = Self {
            dir: dir.to_owned(),
            conn,
            metas: Vec::new(),
            tables: HashMap::new(),
        };
        store.load_catalog()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_catalog(&mut self) -> Result<()> {
        let catalog = self
            .conn
            .prepare("SELECT cf_id, name, kind FROM column_families ORDER BY cf_id")?
            .query_map((), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (cf_id, name, kind) in catalog {
            let meta = StateMetaInfo::new(name.clone(), parse_kind(&kind)?);
            self.tables.insert(name, format!("cf_{cf_id}"));
            self.metas.push(meta);
        }
        Ok(())
    }

    fn table(&self, state: &str) -> Result<&str> {
        self.tables
            .get(state)
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownState(state.to_owned()))
    }
}

impl StateStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn register_state(&mut self, meta: &StateMetaInfo) -> Result<()> {
        if self.tables.contains_key(&meta.name) {
            return Ok(());
        }
        let cf_id = self.metas.len() as i64;
        let table = format!("cf_{cf_id}");
        let txn = self.conn.transaction()?;
        txn.execute(
            "INSERT INTO column_families (cf_id, name, kind) \
             VALUES (?1, ?2, ?3)",
            (cf_id, &meta.name, meta.kind.to_string()),
        )?;
        create_cf_table(&txn, &table)?;
        txn.commit()?;
        tracing::trace!("Registered column family {table} for {meta:?}");
        self.tables.insert(meta.name.clone(), table);
        self.metas.push(meta.clone());
        Ok(())
    }

    fn registered_states(&self) -> &[StateMetaInfo] {
        &self.metas
    }

    fn get(&self, state: &str, prefix: RowPrefix<'_>, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.table(state)?;
        let value = self
            .conn
            .prepare_cached(&format!(
                "SELECT value FROM {table} \
                 WHERE key_group = ?1 AND key = ?2 AND namespace = ?3 AND user_key = ?4"
            ))?
            .query_row(
                (prefix.key_group, prefix.key, prefix.namespace, user_key),
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(
        &mut self,
        state: &str,
        prefix: RowPrefix<'_>,
        user_key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let table = self.table(state)?;
        self.conn
            .prepare_cached(&format!(
                "INSERT INTO {table} (key_group, key, namespace, user_key, value) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (key_group, key, namespace, user_key) DO UPDATE \
                 SET value = excluded.value"
            ))?
            .execute((
                prefix.key_group,
                prefix.key,
                prefix.namespace,
                user_key,
                value,
            ))?;
        Ok(())
    }

    fn delete(&mut self, state: &str, prefix: RowPrefix<'_>, user_key: &[u8]) -> Result<()> {
        let table = self.table(state)?;
        self.conn
            .prepare_cached(&format!(
                "DELETE FROM {table} \
                 WHERE key_group = ?1 AND key = ?2 AND namespace = ?3 AND user_key = ?4"
            ))?
            .execute((prefix.key_group, prefix.key, prefix.namespace, user_key))?;
        Ok(())
    }

    fn scan(&self, state: &str, prefix: RowPrefix<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.table(state)?;
        let rows = self
            .conn
            .prepare_cached(&format!(
                "SELECT user_key, value FROM {table} \
                 WHERE key_group = ?1 AND key = ?2 AND namespace = ?3 \
                 ORDER BY user_key"
            ))?
            .query_map((prefix.key_group, prefix.key, prefix.namespace), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn last_user_key(&self, state: &str, prefix: RowPrefix<'_>) -> Result<Option<Vec<u8>>> {
        let table = self.table(state)?;
        let user_key = self
            .conn
            .prepare_cached(&format!(
                "SELECT user_key FROM {table} \
                 WHERE key_group = ?1 AND key = ?2 AND namespace = ?3 \
                 ORDER BY user_key DESC LIMIT 1"
            ))?
            .query_row((prefix.key_group, prefix.key, prefix.namespace), |row| {
                row.get(0)
            })
            .optional()?;
        Ok(user_key)
    }

    fn delete_all(&mut self, state: &str, prefix: RowPrefix<'_>) -> Result<()> {
        let table = self.table(state)?;
        self.conn
            .prepare_cached(&format!(
                "DELETE FROM {table} \
                 WHERE key_group = ?1 AND key = ?2 AND namespace = ?3"
            ))?
            .execute((prefix.key_group, prefix.key, prefix.namespace))?;
        Ok(())
    }

    #[instrument(name = "sqlite_snapshot", skip(self), fields(dir = ?self.dir))]
    fn snapshot(
        &mut self,
        checkpoint_id: CheckpointId,
        range: KeyGroupRange,
    ) -> Result<KeyGroupsStateHandle> {
        let copy_path = self.dir.join(format!("chk-{checkpoint_id}.sqlite3"));
        let copy_path_str = copy_path
            .to_str()
            .ok_or_else(|| Error::Config(format!("state store path {copy_path:?} is not UTF-8")))?
            .to_owned();
        if copy_path.exists() {
            std::fs::remove_file(&copy_path)?;
        }
        self.conn.execute("VACUUM INTO ?1", (&copy_path_str,))?;

        let res = Connection::open_with_flags(
            &copy_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(Error::from)
        .and_then(|copy| {
            let tables: Vec<&str> = self
                .metas
                .iter()
                .map(|meta| self.table(&meta.name))
                .collect::<Result<_>>()?;
            write_key_groups(range, &self.metas, |state_index, key_group| {
                read_group_rows(&copy, tables[state_index], key_group)
            })
        });

        for suffix in ["", "-wal", "-shm"] {
            let mut path = copy_path_str.clone();
            path.push_str(suffix);
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Error removing snapshot copy {path:?}: {err}");
                }
            }
        }
        res
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        let Self { dir, conn, .. } = *self;
        conn.close().map_err(|(_conn, err)| err)?;
        std::fs::remove_dir_all(&dir)
            .reraise_with(|| format!("error removing state store directory {dir:?}"))?;
        Ok(())
    }
}

#[cfg(test)]
fn prefix(key: &[u8]) -> RowPrefix<'_> {
    RowPrefix {
        key_group: 0,
        key,
        namespace: &[0],
    }
}

#[test]
fn catalog_survives_reopen_of_connection() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("instance");
    let mut store = SqliteStore::open(&store_dir).unwrap();
    store
        .register_state(&StateMetaInfo::new("b", StateKind::List))
        .unwrap();
    store
        .register_state(&StateMetaInfo::new("a", StateKind::Value))
        .unwrap();
    // Registering twice is a no-op.
    store
        .register_state(&StateMetaInfo::new("b", StateKind::List))
        .unwrap();

    store.metas.clear();
    store.tables.clear();
    store.load_catalog().unwrap();
    assert_eq!(
        store.registered_states(),
        &[
            StateMetaInfo::new("b", StateKind::List),
            StateMetaInfo::new("a", StateKind::Value),
        ]
    );
}

#[test]
fn upsert_and_scan() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = SqliteStore::open(&dir.path().join("instance")).unwrap();
    store
        .register_state(&StateMetaInfo::new("m", StateKind::Map))
        .unwrap();
    store.put("m", prefix(b"k"), b"b", b"1").unwrap();
    store.put("m", prefix(b"k"), b"a", b"2").unwrap();
    store.put("m", prefix(b"k"), b"b", b"3").unwrap();
    store.put("m", prefix(b"other"), b"a", b"4").unwrap();
    assert_eq!(
        store.scan("m", prefix(b"k")).unwrap(),
        vec![
            (b"a".to_vec(), b"2".to_vec()),
            (b"b".to_vec(), b"3".to_vec()),
        ]
    );
    assert_eq!(
        store.get("m", prefix(b"k"), b"b").unwrap(),
        Some(b"3".to_vec())
    );
    store.delete("m", prefix(b"k"), b"b").unwrap();
    assert_eq!(
        store.last_user_key("m", prefix(b"k")).unwrap(),
        Some(b"a".to_vec())
    );
    store.delete_all("m", prefix(b"k")).unwrap();
    assert_eq!(store.get("m", prefix(b"k"), b"a").unwrap(), None);
    assert_eq!(store.scan("m", prefix(b"other")).unwrap().len(), 1);
}

#[test]
fn snapshot_leaves_no_copy_and_dispose_removes_dir() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("instance");
    let mut store = SqliteStore::open(&store_dir).unwrap();
    store
        .register_state(&StateMetaInfo::new("v", StateKind::Value))
        .unwrap();
    store.put("v", prefix(b"k"), b"", b"x").unwrap();
    let handle = store
        .snapshot(CheckpointId(1), KeyGroupRange::new(0, 1))
        .unwrap();
    assert!(handle.state_size() > 0);
    assert!(!store_dir.join("chk-1.sqlite3").exists());

    Box::new(store).dispose().unwrap();
    assert!(!store_dir.exists());
}
