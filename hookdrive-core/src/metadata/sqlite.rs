use super::{Entry, EntryKind, MetadataStore};
use crate::manifest::Manifest;
use crate::path;
use crate::{DriveError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Entry row as stored in the database
struct EntryRow {
    path: String,
    kind: String,
    size: i64,
    manifest: Option<String>,
    version: i64,
    modified_at: String,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(0)?,
            kind: row.get(1)?,
            size: row.get(2)?,
            manifest: row.get(3)?,
            version: row.get(4)?,
            modified_at: row.get(5)?,
        })
    }

    fn into_entry(self) -> Result<Entry> {
        let kind = EntryKind::parse(&self.kind).ok_or_else(|| {
            DriveError::Internal(format!("unknown entry kind {} at {}", self.kind, self.path))
        })?;
        let manifest = self
            .manifest
            .map(|json| serde_json::from_str::<Manifest>(&json))
            .transpose()?;

        Ok(Entry {
            path: self.path,
            kind,
            size: self.size as u64,
            manifest,
            version: self.version as u64,
            modified_at: chrono::DateTime::parse_from_rfc3339(&self.modified_at)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?
                .with_timezone(&chrono::Utc),
        })
    }
}

const SELECT_ENTRY: &str =
    "SELECT path, kind, size, manifest, version, modified_at FROM entries";

/// SQLite-backed namespace. Each call opens its own connection, so the store
/// is shareable across threads without further locking.
pub struct SqliteMetadataStore {
    db_path: PathBuf,
}

impl SqliteMetadataStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                path TEXT PRIMARY KEY,
                parent TEXT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                size INTEGER NOT NULL,
                manifest TEXT,
                version INTEGER NOT NULL,
                modified_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entries_parent ON entries(parent, name)",
            [],
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO entries (path, parent, name, kind, size, manifest, version, modified_at)
             VALUES (?1, NULL, '', ?2, 0, NULL, 0, ?3)",
            params![
                path::ROOT,
                EntryKind::Directory.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;

        Ok(())
    }
}

fn load(conn: &Connection, target: &str) -> Result<Option<Entry>> {
    let row = conn
        .query_row(
            &format!("{} WHERE path = ?1", SELECT_ENTRY),
            [target],
            EntryRow::from_row,
        )
        .optional()?;
    row.map(EntryRow::into_entry).transpose()
}

fn require_parent_dir(conn: &Connection, target: &str) -> Result<()> {
    let parent = path::parent(target)
        .ok_or_else(|| DriveError::InvalidRequest("the root has no parent".to_string()))?;
    match load(conn, parent)? {
        None => Err(DriveError::NotFound(parent.to_string())),
        Some(entry) if !entry.is_dir() => Err(DriveError::NotADirectory(parent.to_string())),
        Some(_) => Ok(()),
    }
}

fn insert(conn: &Connection, entry: &Entry) -> Result<()> {
    let manifest = entry
        .manifest
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO entries (path, parent, name, kind, size, manifest, version, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.path,
            path::parent(&entry.path),
            entry.name(),
            entry.kind.as_str(),
            entry.size as i64,
            manifest,
            entry.version as i64,
            entry.modified_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

impl MetadataStore for SqliteMetadataStore {
    fn get(&self, target: &str) -> Result<Option<Entry>> {
        let conn = self.get_conn()?;
        load(&conn, target)
    }

    fn create_dir(&self, target: &str) -> Result<Entry> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load(&tx, target)?.is_some() {
            return Err(DriveError::AlreadyExists(target.to_string()));
        }
        require_parent_dir(&tx, target)?;

        let entry = Entry::directory(target, Utc::now());
        insert(&tx, &entry)?;
        tx.commit()?;
        Ok(entry)
    }

    fn create_file(&self, target: &str) -> Result<Entry> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match load(&tx, target)? {
            Some(entry) if entry.is_file() => return Ok(entry),
            Some(_) => return Err(DriveError::IsADirectory(target.to_string())),
            None => {}
        }
        require_parent_dir(&tx, target)?;

        let entry = Entry::file(target, Utc::now());
        insert(&tx, &entry)?;
        tx.commit()?;
        Ok(entry)
    }

    fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        let conn = self.get_conn()?;
        match load(&conn, dir)? {
            None => return Err(DriveError::NotFound(dir.to_string())),
            Some(entry) if !entry.is_dir() => {
                return Err(DriveError::NotADirectory(dir.to_string()));
            }
            Some(_) => {}
        }

        let mut stmt = conn.prepare(&format!(
            "{} WHERE parent = ?1 ORDER BY name",
            SELECT_ENTRY
        ))?;
        let rows = stmt
            .query_map([dir], EntryRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    fn commit_manifest(
        &self,
        target: &str,
        expected_version: u64,
        manifest: &Manifest,
        modified_at: DateTime<Utc>,
    ) -> Result<Entry> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut entry =
            load(&tx, target)?.ok_or_else(|| DriveError::NotFound(target.to_string()))?;
        if entry.is_dir() {
            return Err(DriveError::IsADirectory(target.to_string()));
        }

        let manifest_json = serde_json::to_string(manifest)?;
        let updated = tx.execute(
            "UPDATE entries SET manifest = ?1, size = ?2, version = version + 1, modified_at = ?3
             WHERE path = ?4 AND version = ?5",
            params![
                manifest_json,
                manifest.size as i64,
                modified_at.to_rfc3339(),
                target,
                expected_version as i64,
            ],
        )?;
        if updated == 0 {
            return Err(DriveError::Conflict(format!(
                "{} is at version {}, expected {}",
                target, entry.version, expected_version
            )));
        }
        tx.commit()?;

        entry.size = manifest.size;
        entry.manifest = Some(manifest.clone());
        entry.version = expected_version + 1;
        entry.modified_at = modified_at;
        Ok(entry)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        if path::is_root(from) {
            return Err(DriveError::InvalidRequest(
                "the root cannot be renamed".to_string(),
            ));
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load(&tx, from)?.is_none() {
            return Err(DriveError::NotFound(from.to_string()));
        }
        if from == to {
            return Ok(());
        }
        if path::is_descendant(to, from) {
            return Err(DriveError::InvalidRequest(format!(
                "cannot move {} under itself",
                from
            )));
        }
        if load(&tx, to)?.is_some() {
            return Err(DriveError::AlreadyExists(to.to_string()));
        }
        require_parent_dir(&tx, to)?;

        let moved: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT path FROM entries
                 WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'",
            )?;
            let paths = stmt
                .query_map([from], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            paths
        };

        for old in &moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            tx.execute(
                "UPDATE entries SET path = ?1, parent = ?2, name = ?3 WHERE path = ?4",
                params![new, path::parent(&new), path::name(&new), old],
            )?;
        }

        tx.commit()?;
        tracing::debug!("Renamed {} entries from {} to {}", moved.len(), from, to);
        Ok(())
    }

    fn remove_file(&self, target: &str) -> Result<Entry> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let entry = match load(&tx, target)? {
            None => return Err(DriveError::NotFound(target.to_string())),
            Some(entry) if entry.is_dir() => {
                return Err(DriveError::IsADirectory(target.to_string()));
            }
            Some(entry) => entry,
        };

        tx.execute("DELETE FROM entries WHERE path = ?1", [target])?;
        tx.commit()?;
        Ok(entry)
    }

    fn remove_dir(&self, target: &str) -> Result<()> {
        if path::is_root(target) {
            return Err(DriveError::InvalidRequest(
                "the root cannot be removed".to_string(),
            ));
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match load(&tx, target)? {
            None => return Err(DriveError::NotFound(target.to_string())),
            Some(entry) if !entry.is_dir() => {
                return Err(DriveError::NotADirectory(target.to_string()));
            }
            Some(_) => {}
        }

        let children: i64 = tx.query_row(
            "SELECT COUNT(*) FROM entries WHERE parent = ?1",
            [target],
            |row| row.get(0),
        )?;
        if children > 0 {
            return Err(DriveError::DirectoryNotEmpty(target.to_string()));
        }

        tx.execute("DELETE FROM entries WHERE path = ?1", [target])?;
        tx.commit()?;
        Ok(())
    }
}
