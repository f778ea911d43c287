//! SQLite resource store
//!
//! One row per object. Every write bumps a store-wide revision so a manager
//! process can pick up writes made by other processes (`kubechain apply`)
//! and turn them into watch events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    LabelSelector, ResourceStore, StoreResult, WatchChange, WatchEvent, WATCH_CAPACITY,
};
use crate::api::{DynamicObject, Kind, ObjectKey, ObjectMeta, OwnerReference};
use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS objects (
    kind TEXT NOT NULL,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    uid TEXT NOT NULL UNIQUE,
    resource_version INTEGER NOT NULL,
    labels TEXT NOT NULL,
    owners TEXT NOT NULL,
    spec TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    revision INTEGER NOT NULL,
    PRIMARY KEY (kind, namespace, name)
);
CREATE INDEX IF NOT EXISTS idx_objects_revision ON objects(revision);
CREATE TABLE IF NOT EXISTS tombstones (
    kind TEXT NOT NULL,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    owners TEXT NOT NULL,
    revision INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO store_meta (key, value) VALUES ('revision', 0);
";

/// SQLite connection holder
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn new(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("creating {:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Persistent store
pub struct SqliteStore {
    db: Database,
    events: broadcast::Sender<WatchEvent>,
    last_seen_revision: AtomicI64,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        info!("Opening resource store at {:?}", path);
        Ok(Self::with_database(Database::new(path)?))
    }

    pub fn in_memory() -> StoreResult<Self> {
        Ok(Self::with_database(Database::in_memory()?))
    }

    fn with_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let current = current_revision(&db.conn()).unwrap_or(0);
        Self {
            db,
            events,
            last_seen_revision: AtomicI64::new(current),
        }
    }

    fn notify(&self, event: WatchEvent) {
        let _ = self.events.send(event);
    }

    /// Emit watch events for every write with a revision newer than the last poll.
    ///
    /// Local writes are emitted twice (once directly, once here); subscribers
    /// de-duplicate through the work queue.
    pub fn poll_changes(&self) -> StoreResult<usize> {
        let since = self.last_seen_revision.load(Ordering::SeqCst);
        let (events, newest) = {
            let conn = self.db.conn();
            let mut events = Vec::new();
            let mut newest = since;

            let mut stmt = conn.prepare(
                "SELECT kind, namespace, name, owners, revision FROM objects WHERE revision > ?1
                 UNION ALL
                 SELECT kind, namespace, name, owners, -revision FROM tombstones WHERE revision > ?1",
            )?;
            let rows = stmt.query_map([since], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            for row in rows {
                let (kind, namespace, name, owners, revision) = row?;
                let Ok(kind) = kind.parse::<Kind>() else {
                    warn!("Skipping row with unknown kind {}", kind);
                    continue;
                };
                let change = if revision < 0 {
                    WatchChange::Deleted
                } else {
                    WatchChange::Updated
                };
                newest = newest.max(revision.abs());
                events.push(WatchEvent {
                    kind,
                    key: ObjectKey::new(namespace, name),
                    owners: serde_json::from_str(&owners).unwrap_or_default(),
                    change,
                });
            }
            (events, newest)
        };

        self.last_seen_revision.store(newest, Ordering::SeqCst);
        let count = events.len();
        for event in events {
            self.notify(event);
        }
        if count > 0 {
            debug!("Polled {} store changes up to revision {}", count, newest);
        }
        Ok(count)
    }

    /// Poll for external writes until the handle is aborted
    pub fn spawn_change_poller(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_changes() {
                    warn!("Store change poll failed: {}", e);
                }
            }
        })
    }
}

fn current_revision(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'revision'",
        [],
        |row| row.get(0),
    )?)
}

fn next_revision(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.query_row(
        "UPDATE store_meta SET value = value + 1 WHERE key = 'revision' RETURNING value",
        [],
        |row| row.get(0),
    )?)
}

const SELECT_COLUMNS: &str =
    "kind, namespace, name, uid, resource_version, labels, owners, spec, status, created_at";

struct RawRow {
    kind: String,
    namespace: String,
    name: String,
    uid: String,
    resource_version: i64,
    labels: String,
    owners: String,
    spec: String,
    status: String,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        kind: row.get(0)?,
        namespace: row.get(1)?,
        name: row.get(2)?,
        uid: row.get(3)?,
        resource_version: row.get(4)?,
        labels: row.get(5)?,
        owners: row.get(6)?,
        spec: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn decode_row(raw: RawRow) -> StoreResult<DynamicObject> {
    let kind: Kind = raw.kind.parse().map_err(StoreError::Backend)?;
    let codec = |source| StoreError::Codec { kind, source };
    let labels: BTreeMap<String, String> = serde_json::from_str(&raw.labels).map_err(codec)?;
    let owner_references: Vec<OwnerReference> =
        serde_json::from_str(&raw.owners).map_err(codec)?;
    let creation_timestamp = DateTime::parse_from_rfc3339(&raw.created_at)
        .ok()
        .map(|t| t.with_timezone(&Utc));

    Ok(DynamicObject {
        kind,
        metadata: ObjectMeta {
            name: raw.name,
            namespace: raw.namespace,
            uid: raw.uid,
            resource_version: raw.resource_version as u64,
            labels,
            owner_references,
            creation_timestamp,
        },
        spec: serde_json::from_str(&raw.spec).map_err(codec)?,
        status: serde_json::from_str(&raw.status).map_err(codec)?,
    })
}

fn to_json(kind: Kind, value: &impl serde::Serialize) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|source| StoreError::Codec { kind, source })
}

fn fetch(conn: &Connection, kind: Kind, key: &ObjectKey) -> StoreResult<Option<DynamicObject>> {
    let sql = format!(
        "SELECT {} FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
        SELECT_COLUMNS
    );
    let raw = conn
        .query_row(
            &sql,
            params![kind.as_str(), key.namespace, key.name],
            read_row,
        )
        .optional()?;
    raw.map(decode_row).transpose()
}

fn insert(conn: &Connection, obj: &mut DynamicObject) -> StoreResult<()> {
    let now = Utc::now();
    obj.metadata.uid = uuid::Uuid::new_v4().to_string();
    obj.metadata.resource_version = 1;
    obj.metadata.creation_timestamp = Some(now);

    let revision = next_revision(conn)?;
    conn.execute(
        "INSERT INTO objects (kind, namespace, name, uid, resource_version, labels, owners, spec, status, created_at, revision)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            obj.kind.as_str(),
            obj.metadata.namespace,
            obj.metadata.name,
            obj.metadata.uid,
            obj.metadata.resource_version as i64,
            to_json(obj.kind, &obj.metadata.labels)?,
            to_json(obj.kind, &obj.metadata.owner_references)?,
            to_json(obj.kind, &obj.spec)?,
            to_json(obj.kind, &obj.status)?,
            now.to_rfc3339(),
            revision,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get_dynamic(&self, kind: Kind, key: &ObjectKey) -> StoreResult<DynamicObject> {
        fetch(&self.db.conn(), kind, key)?.ok_or_else(|| StoreError::NotFound {
            kind,
            key: key.clone(),
        })
    }

    async fn list_dynamic(
        &self,
        kind: Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<DynamicObject>> {
        let conn = self.db.conn();
        let sql = format!(
            "SELECT {} FROM objects WHERE kind = ?1 AND (?2 IS NULL OR namespace = ?2) ORDER BY namespace, name",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![kind.as_str(), namespace], read_row)?;

        let mut objects = Vec::new();
        for row in rows {
            let obj = decode_row(row?)?;
            if selector.matches(&obj.metadata.labels) {
                objects.push(obj);
            }
        }
        Ok(objects)
    }

    async fn create_dynamic(&self, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        {
            let conn = self.db.conn();
            if fetch(&conn, obj.kind, &obj.key())?.is_some() {
                return Err(StoreError::AlreadyExists {
                    kind: obj.kind,
                    key: obj.key(),
                });
            }
            insert(&conn, &mut obj)?;
        }
        debug!("Created {} {}", obj.kind, obj.key());
        self.notify(WatchEvent::for_object(&obj, WatchChange::Created));
        Ok(obj)
    }

    async fn apply_dynamic(&self, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let (stored, change) = {
            let conn = self.db.conn();
            match fetch(&conn, obj.kind, &obj.key())? {
                None => {
                    insert(&conn, &mut obj)?;
                    (obj, WatchChange::Created)
                }
                Some(mut existing) => {
                    existing.spec = obj.spec;
                    existing.metadata.labels = obj.metadata.labels;
                    if !obj.metadata.owner_references.is_empty() {
                        existing.metadata.owner_references = obj.metadata.owner_references;
                    }
                    existing.metadata.resource_version += 1;
                    let revision = next_revision(&conn)?;
                    conn.execute(
                        "UPDATE objects SET spec = ?1, labels = ?2, owners = ?3, resource_version = ?4, revision = ?5
                         WHERE kind = ?6 AND namespace = ?7 AND name = ?8",
                        params![
                            to_json(existing.kind, &existing.spec)?,
                            to_json(existing.kind, &existing.metadata.labels)?,
                            to_json(existing.kind, &existing.metadata.owner_references)?,
                            existing.metadata.resource_version as i64,
                            revision,
                            existing.kind.as_str(),
                            existing.metadata.namespace,
                            existing.metadata.name,
                        ],
                    )?;
                    (existing, WatchChange::Updated)
                }
            }
        };
        self.notify(WatchEvent::for_object(&stored, change));
        Ok(stored)
    }

    async fn update_status_dynamic(
        &self,
        kind: Kind,
        key: &ObjectKey,
        status: Value,
        expected_version: u64,
    ) -> StoreResult<DynamicObject> {
        let updated = {
            let conn = self.db.conn();
            let revision = next_revision(&conn)?;
            let affected = conn.execute(
                "UPDATE objects SET status = ?1, resource_version = resource_version + 1, revision = ?2
                 WHERE kind = ?3 AND namespace = ?4 AND name = ?5 AND resource_version = ?6",
                params![
                    to_json(kind, &status)?,
                    revision,
                    kind.as_str(),
                    key.namespace,
                    key.name,
                    expected_version as i64,
                ],
            )?;

            let current = fetch(&conn, kind, key)?.ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.clone(),
            })?;
            if affected == 0 {
                return Err(StoreError::Conflict {
                    kind,
                    key: key.clone(),
                    expected: expected_version,
                    actual: current.metadata.resource_version,
                });
            }
            current
        };
        self.notify(WatchEvent::for_object(&updated, WatchChange::Updated));
        Ok(updated)
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey) -> StoreResult<Vec<(Kind, ObjectKey)>> {
        let removed = {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;

            let root = fetch(&tx, kind, key)?.ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.clone(),
            })?;

            // Owned objects, found breadth-first through owner uids
            let mut removed = vec![root];
            let mut owners: HashSet<String> = HashSet::from([removed[0].metadata.uid.clone()]);
            loop {
                let sql = format!("SELECT {} FROM objects", SELECT_COLUMNS);
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map([], read_row)?;
                let mut children = Vec::new();
                for row in rows {
                    let obj = decode_row(row?)?;
                    let already = removed.iter().any(|r| r.metadata.uid == obj.metadata.uid);
                    if !already
                        && obj
                            .metadata
                            .owner_references
                            .iter()
                            .any(|o| owners.contains(&o.uid))
                    {
                        children.push(obj);
                    }
                }
                if children.is_empty() {
                    break;
                }
                for child in children {
                    owners.insert(child.metadata.uid.clone());
                    removed.push(child);
                }
            }

            for obj in &removed {
                let revision = next_revision(&tx)?;
                tx.execute(
                    "DELETE FROM objects WHERE uid = ?1",
                    params![obj.metadata.uid],
                )?;
                tx.execute(
                    "INSERT INTO tombstones (kind, namespace, name, owners, revision) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        obj.kind.as_str(),
                        obj.metadata.namespace,
                        obj.metadata.name,
                        to_json(obj.kind, &obj.metadata.owner_references)?,
                        revision,
                    ],
                )?;
            }
            tx.commit()?;
            removed
        };

        for obj in &removed {
            debug!("Deleted {} {}", obj.kind, obj.key());
            self.notify(WatchEvent::for_object(obj, WatchChange::Deleted));
        }
        Ok(removed.iter().map(|o| (o.kind, o.key())).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
