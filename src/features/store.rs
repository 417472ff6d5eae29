// Local document store: endorsement history plus the device's user profile.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use sqlite::{Connection, ConnectionThreadSafe, State, Statement};
use tracing::{debug, info, warn};

use crate::error::{EndorseError, Result};
use crate::model::{
    EndorsedDocumentRecord, EndorsementKind, FileKind, Placement, SubscriptionTier,
    UserProfileRecord,
};

/// Highest schema version this build knows how to create or upgrade to.
pub const SCHEMA_VERSION: i64 = 1;

/// Upgrade steps; entry `n` moves the schema from version `n` to `n + 1`.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY NOT NULL,
        file_name TEXT NOT NULL,
        file_kind TEXT NOT NULL,
        original_blob BLOB NOT NULL,
        endorsed_blob BLOB NOT NULL,
        endorsed_pages TEXT,
        remarks TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        endorsement_kind TEXT NOT NULL,
        placement_x REAL NOT NULL,
        placement_y REAL NOT NULL,
        placement_page INTEGER
    );
    CREATE INDEX IF NOT EXISTS documents_created_at ON documents (created_at);
    CREATE INDEX IF NOT EXISTS documents_file_kind ON documents (file_kind);
    CREATE TABLE IF NOT EXISTS user_profile (
        slot INTEGER PRIMARY KEY NOT NULL CHECK (slot = 0),
        email TEXT NOT NULL,
        name TEXT NOT NULL,
        signature_image BLOB,
        stamp_image BLOB,
        is_authenticated INTEGER NOT NULL,
        subscription_tier TEXT NOT NULL
    );",
];

const DOCUMENT_COLUMNS: &str = "id, file_name, file_kind, original_blob, endorsed_blob, \
     endorsed_pages, remarks, created_at, endorsement_kind, placement_x, placement_y, placement_page";

/// The profile table holds exactly one row, in this slot.
const PROFILE_SLOT: i64 = 0;

/// Persistence seam for endorsement history and the user profile.
///
/// Every call is its own atomic unit. Absent ids are not errors.
pub trait EndorsementStore {
    /// Opens or creates the backing storage. Safe to call repeatedly; other
    /// operations open lazily.
    fn initialize(&self) -> Result<()>;

    /// Insert-or-replace by `record.id`.
    fn put(&self, record: &EndorsedDocumentRecord) -> Result<()>;

    /// All records in storage order. Sort before display.
    fn list_all(&self) -> Result<Vec<EndorsedDocumentRecord>>;

    fn get(&self, id: &str) -> Result<Option<EndorsedDocumentRecord>>;

    /// No-op when `id` is absent.
    fn delete_by_id(&self, id: &str) -> Result<()>;

    /// Returns `false` when `id` is absent.
    fn update_remarks(&self, id: &str, remarks: &str) -> Result<bool> {
        match self.get(id)? {
            Some(mut record) => {
                record.remarks = remarks.to_string();
                self.put(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replaces the stored profile wholesale.
    fn put_user_profile(&self, profile: &UserProfileRecord) -> Result<()>;

    fn get_user_profile(&self) -> Result<Option<UserProfileRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    Unopened,
    Opening,
    Ready,
}

impl StorePhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => StorePhase::Opening,
            2 => StorePhase::Ready,
            _ => StorePhase::Unopened,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite-backed [`EndorsementStore`].
///
/// The connection is opened on first use behind a mutex, so callers that
/// arrive while the open is in flight wait for it instead of racing it.
pub struct SqliteStore {
    location: Location,
    conn: Mutex<Option<ConnectionThreadSafe>>,
    phase: AtomicU8,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_location(Location::File(path.as_ref().to_path_buf()))
    }

    /// Private database that disappears with the handle.
    pub fn in_memory() -> Self {
        Self::with_location(Location::Memory)
    }

    fn with_location(location: Location) -> Self {
        Self {
            location,
            conn: Mutex::new(None),
            phase: AtomicU8::new(StorePhase::Unopened as u8),
        }
    }

    pub fn phase(&self) -> StorePhase {
        StorePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn lock(&self) -> MutexGuard<'_, Option<ConnectionThreadSafe>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("store mutex poisoned, continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(EndorseError::StoreUnavailable("not_open".into())),
        }
    }

    fn open(&self) -> Result<ConnectionThreadSafe> {
        self.phase.store(StorePhase::Opening as u8, Ordering::Release);
        let opened = match &self.location {
            Location::File(path) => Connection::open_thread_safe(path),
            Location::Memory => Connection::open_thread_safe(":memory:"),
        }
        .map_err(EndorseError::from)
        .and_then(|conn| migrate(&conn).map(|_| conn));

        match opened {
            Ok(conn) => {
                self.phase.store(StorePhase::Ready as u8, Ordering::Release);
                info!(location = ?self.location, schema = SCHEMA_VERSION, "store ready");
                Ok(conn)
            }
            Err(err) => {
                self.phase.store(StorePhase::Unopened as u8, Ordering::Release);
                warn!(location = ?self.location, error = %err, "store open failed");
                Err(err)
            }
        }
    }
}

impl EndorsementStore for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.with_connection(|_| Ok(()))
    }

    fn put(&self, record: &EndorsedDocumentRecord) -> Result<()> {
        let pages = record
            .endorsed_page_indices
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| EndorseError::StoreUnavailable(format!("pages_encode:{e}")))?;
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(format!(
                "INSERT OR REPLACE INTO documents ({DOCUMENT_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))?;
            stmt.bind((1, record.id.as_str()))?;
            stmt.bind((2, record.file_name.as_str()))?;
            stmt.bind((3, record.file_kind.as_str()))?;
            stmt.bind((4, record.original_blob.as_slice()))?;
            stmt.bind((5, record.endorsed_blob.as_slice()))?;
            stmt.bind((6, pages.as_deref()))?;
            stmt.bind((7, record.remarks.as_str()))?;
            stmt.bind((8, record.created_at_millis))?;
            stmt.bind((9, record.endorsement_kind.as_str()))?;
            stmt.bind((10, record.placement.x))?;
            stmt.bind((11, record.placement.y))?;
            stmt.bind((12, record.placement.page_index.map(i64::from)))?;
            run_to_completion(&mut stmt)?;
            debug!(id = %record.id, "document stored");
            Ok(())
        })
    }

    fn list_all(&self) -> Result<Vec<EndorsedDocumentRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(format!("SELECT {DOCUMENT_COLUMNS} FROM documents"))?;
            let mut records = Vec::new();
            while let State::Row = stmt.next()? {
                records.push(read_record(&stmt)?);
            }
            Ok(records)
        })
    }

    fn get(&self, id: &str) -> Result<Option<EndorsedDocumentRecord>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare(format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"))?;
            stmt.bind((1, id))?;
            match stmt.next()? {
                State::Row => read_record(&stmt).map(Some),
                State::Done => Ok(None),
            }
        })
    }

    fn delete_by_id(&self, id: &str) -> Result<()> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("DELETE FROM documents WHERE id = ?")?;
            stmt.bind((1, id))?;
            run_to_completion(&mut stmt)?;
            debug!(id, removed = conn.change_count(), "document delete");
            Ok(())
        })
    }

    fn update_remarks(&self, id: &str, remarks: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("UPDATE documents SET remarks = ? WHERE id = ?")?;
            stmt.bind((1, remarks))?;
            stmt.bind((2, id))?;
            run_to_completion(&mut stmt)?;
            Ok(conn.change_count() > 0)
        })
    }

    fn put_user_profile(&self, profile: &UserProfileRecord) -> Result<()> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "INSERT OR REPLACE INTO user_profile \
                 (slot, email, name, signature_image, stamp_image, is_authenticated, subscription_tier) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            stmt.bind((1, PROFILE_SLOT))?;
            stmt.bind((2, profile.email.as_str()))?;
            stmt.bind((3, profile.name.as_str()))?;
            stmt.bind((4, profile.signature_image.as_deref()))?;
            stmt.bind((5, profile.stamp_image.as_deref()))?;
            stmt.bind((6, i64::from(profile.is_authenticated)))?;
            stmt.bind((7, profile.subscription_tier.as_str()))?;
            run_to_completion(&mut stmt)
        })
    }

    fn get_user_profile(&self) -> Result<Option<UserProfileRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT email, name, signature_image, stamp_image, is_authenticated, subscription_tier \
                 FROM user_profile WHERE slot = ?",
            )?;
            stmt.bind((1, PROFILE_SLOT))?;
            if let State::Done = stmt.next()? {
                return Ok(None);
            }
            let tier: String = stmt.read(5)?;
            Ok(Some(UserProfileRecord {
                email: stmt.read(0)?,
                name: stmt.read(1)?,
                signature_image: stmt.read::<Option<Vec<u8>>, _>(2)?,
                stamp_image: stmt.read::<Option<Vec<u8>>, _>(3)?,
                is_authenticated: stmt.read::<i64, _>(4)? != 0,
                subscription_tier: SubscriptionTier::parse(&tier)
                    .ok_or_else(|| corrupt("subscription_tier", &tier))?,
            }))
        })
    }
}

fn run_to_completion(stmt: &mut Statement<'_>) -> Result<()> {
    while let State::Row = stmt.next()? {}
    Ok(())
}

fn corrupt(column: &str, value: &str) -> EndorseError {
    EndorseError::StoreUnavailable(format!("invalid_{column}:{value}"))
}

fn read_record(stmt: &Statement<'_>) -> Result<EndorsedDocumentRecord> {
    let file_kind: String = stmt.read(2)?;
    let endorsement_kind: String = stmt.read(8)?;
    let pages: Option<String> = stmt.read(5)?;
    let endorsed_page_indices = pages
        .map(|raw| serde_json::from_str::<Vec<u32>>(&raw).map_err(|_| corrupt("endorsed_pages", &raw)))
        .transpose()?;
    let page_index = stmt
        .read::<Option<i64>, _>(11)?
        .map(|p| u32::try_from(p).map_err(|_| corrupt("placement_page", &p.to_string())))
        .transpose()?;

    Ok(EndorsedDocumentRecord {
        id: stmt.read(0)?,
        file_name: stmt.read(1)?,
        file_kind: FileKind::parse(&file_kind).ok_or_else(|| corrupt("file_kind", &file_kind))?,
        original_blob: stmt.read(3)?,
        endorsed_blob: stmt.read(4)?,
        endorsed_page_indices,
        remarks: stmt.read(6)?,
        created_at_millis: stmt.read(7)?,
        endorsement_kind: EndorsementKind::parse(&endorsement_kind)
            .ok_or_else(|| corrupt("endorsement_kind", &endorsement_kind))?,
        placement: Placement {
            x: stmt.read(9)?,
            y: stmt.read(10)?,
            page_index,
        },
    })
}

fn user_version(conn: &Connection) -> Result<i64> {
    let mut stmt = conn.prepare("PRAGMA user_version")?;
    match stmt.next()? {
        State::Row => Ok(stmt.read::<i64, _>(0)?),
        State::Done => Ok(0),
    }
}

/// Brings the schema from its stored `user_version` up to [`SCHEMA_VERSION`],
/// one transaction per step.
fn migrate(conn: &Connection) -> Result<()> {
    let current = user_version(conn)?;
    if current < 0 {
        return Err(EndorseError::StoreUnavailable(format!("schema_invalid:{current}")));
    }
    if current > SCHEMA_VERSION {
        return Err(EndorseError::StoreUnavailable(format!(
            "schema_too_new:{current}>{SCHEMA_VERSION}"
        )));
    }
    for (step, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let target = step as i64 + 1;
        conn.execute("BEGIN IMMEDIATE")?;
        let applied = conn
            .execute(sql)
            .and_then(|_| conn.execute(format!("PRAGMA user_version = {target}")))
            .and_then(|_| conn.execute("COMMIT"));
        if let Err(err) = applied {
            let _ = conn.execute("ROLLBACK");
            return Err(err.into());
        }
        info!(from = target - 1, to = target, "store schema migrated");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    pub(crate) fn record(id: &str, created_at_millis: i64) -> EndorsedDocumentRecord {
        EndorsedDocumentRecord {
            id: id.to_string(),
            file_name: format!("{id}.pdf"),
            file_kind: FileKind::Pdf,
            original_blob: vec![1, 2, 3],
            endorsed_blob: vec![4, 5, 6, 7],
            endorsed_page_indices: Some(vec![0, 2]),
            remarks: "checked at port".into(),
            created_at_millis,
            endorsement_kind: EndorsementKind::Stamp,
            placement: Placement {
                x: 100.5,
                y: 42.25,
                page_index: Some(2),
            },
        }
    }

    fn table_count(store: &SqliteStore) -> i64 {
        store
            .with_connection(|conn| {
                let mut stmt =
                    conn.prepare("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")?;
                stmt.next()?;
                Ok(stmt.read::<i64, _>(0)?)
            })
            .unwrap()
    }

    #[test]
    fn put_then_get_returns_identical_record() {
        let store = SqliteStore::in_memory();
        let rec = record("a", 10);
        store.put(&rec).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(rec.clone()));
        assert_eq!(store.list_all().unwrap(), vec![rec]);
    }

    #[test]
    fn optional_fields_survive_as_absent() {
        let store = SqliteStore::in_memory();
        let mut rec = record("img", 5);
        rec.file_kind = FileKind::Image;
        rec.endorsed_page_indices = None;
        rec.placement.page_index = None;
        rec.remarks.clear();
        store.put(&rec).unwrap();
        assert_eq!(store.get("img").unwrap(), Some(rec));
    }

    #[test]
    fn put_with_same_id_replaces() {
        let store = SqliteStore::in_memory();
        store.put(&record("a", 10)).unwrap();
        let mut newer = record("a", 20);
        newer.remarks = "second".into();
        store.put(&newer).unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], newer);
    }

    #[test]
    fn delete_missing_id_is_noop() {
        let store = SqliteStore::in_memory();
        store.put(&record("keep", 1)).unwrap();
        store.delete_by_id("missing").unwrap();
        assert_eq!(store.list_all().unwrap().len(), 1);

        store.delete_by_id("keep").unwrap();
        assert!(store.list_all().unwrap().is_empty());
        assert_eq!(store.get("keep").unwrap(), None);
    }

    #[test]
    fn update_remarks_touches_only_remarks() {
        let store = SqliteStore::in_memory();
        let rec = record("r", 3);
        store.put(&rec).unwrap();
        assert!(store.update_remarks("r", "stamped twice").unwrap());
        assert!(!store.update_remarks("ghost", "x").unwrap());

        let stored = store.get("r").unwrap().unwrap();
        assert_eq!(stored.remarks, "stamped twice");
        assert_eq!(EndorsedDocumentRecord { remarks: rec.remarks.clone(), ..stored }, rec);
    }

    #[test]
    fn profile_is_a_single_overwritten_row() {
        let store = SqliteStore::in_memory();
        assert_eq!(store.get_user_profile().unwrap(), None);

        let first = UserProfileRecord {
            email: "mate@vessel.test".into(),
            name: "Chief Mate".into(),
            signature_image: Some(vec![9, 9]),
            stamp_image: None,
            is_authenticated: true,
            subscription_tier: SubscriptionTier::Premium,
        };
        store.put_user_profile(&first).unwrap();
        assert_eq!(store.get_user_profile().unwrap(), Some(first));

        let second = UserProfileRecord {
            name: "Captain".into(),
            ..Default::default()
        };
        store.put_user_profile(&second).unwrap();
        assert_eq!(store.get_user_profile().unwrap(), Some(second));
    }

    #[test]
    fn operations_open_lazily_and_initialize_is_idempotent() {
        let store = SqliteStore::in_memory();
        assert_eq!(store.phase(), StorePhase::Unopened);
        assert!(store.list_all().unwrap().is_empty());
        assert_eq!(store.phase(), StorePhase::Ready);

        store.initialize().unwrap();
        store.initialize().unwrap();
        assert_eq!(table_count(&store), 2);
    }

    #[test]
    fn concurrent_initialize_creates_schema_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("endorser.db")));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.initialize().unwrap();
                    store.put(&record(&format!("doc-{i}"), i)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.phase(), StorePhase::Ready);
        assert_eq!(table_count(&store), 2);
        assert_eq!(store.list_all().unwrap().len(), 8);
    }

    #[test]
    fn data_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endorser.db");
        {
            let store = SqliteStore::new(&path);
            store.put(&record("kept", 7)).unwrap();
        }
        let reopened = SqliteStore::new(&path);
        assert_eq!(reopened.get("kept").unwrap(), Some(record("kept", 7)));
    }

    #[test]
    fn unopenable_location_reports_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path());
        assert!(matches!(store.initialize(), Err(EndorseError::StoreUnavailable(_))));
        assert_eq!(store.phase(), StorePhase::Unopened);
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("PRAGMA user_version = 99").unwrap();
        }
        let store = SqliteStore::new(&path);
        match store.initialize() {
            Err(EndorseError::StoreUnavailable(detail)) => assert!(detail.contains("schema_too_new")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn negative_schema_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("PRAGMA user_version = -1").unwrap();
        }
        let store = SqliteStore::new(&path);
        match store.initialize() {
            Err(EndorseError::StoreUnavailable(detail)) => assert_eq!(detail, "schema_invalid:-1"),
            other => panic!("unexpected: {other:?}"),
        }
        let conn = Connection::open(&path).unwrap();
        assert_eq!(user_version(&conn).unwrap(), -1);
    }
}
