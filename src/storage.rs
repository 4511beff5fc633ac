use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context as _;
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};

use crate::{
    pattern::glob_matches,
    record::{RecordedEntry, RequestRecord, ResponseRecord, generate_id, now_unix_ms},
};

/// Which persistence backing to open. The wire names follow the config file
/// (`lowdb` is the journal document, `sqlite` the embedded database).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    #[serde(rename = "lowdb")]
    Journal,
    #[serde(rename = "sqlite")]
    Sqlite,
}

/// One storage instance. Both backings expose the identical contract; every
/// operation is its own transaction and is safe under concurrent callers.
#[derive(Debug, Clone)]
pub enum Storage {
    Journal(JournalStorage),
    Sqlite(SqliteStorage),
}

impl Storage {
    pub fn open(backend: StorageBackend, path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        match backend {
            StorageBackend::Journal => Ok(Self::Journal(JournalStorage::open(path.into())?)),
            StorageBackend::Sqlite => Ok(Self::Sqlite(SqliteStorage::open(path.into())?)),
        }
    }

    /// Persists a new immutable entry with a fresh id and creation instant.
    pub async fn save(
        &self,
        request: RequestRecord,
        response: ResponseRecord,
    ) -> anyhow::Result<RecordedEntry> {
        let entry = RecordedEntry {
            id: generate_id(),
            request,
            response,
            created_at_unix_ms: now_unix_ms()?,
        };
        match self {
            Self::Journal(journal) => journal.save(entry).await,
            Self::Sqlite(sqlite) => sqlite.save(entry).await,
        }
    }

    /// Point lookup: the most recently created entry with identical method
    /// and path. Approximate matching iterates `list()` instead.
    pub async fn find(&self, method: &str, path: &str) -> anyhow::Result<Option<RecordedEntry>> {
        match self {
            Self::Journal(journal) => journal.find(method, path),
            Self::Sqlite(sqlite) => sqlite.find(method, path).await,
        }
    }

    pub async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<RecordedEntry>> {
        match self {
            Self::Journal(journal) => journal.find_by_id(id),
            Self::Sqlite(sqlite) => sqlite.find_by_id(id).await,
        }
    }

    /// All entries, most recently created first.
    pub async fn list(&self) -> anyhow::Result<Vec<RecordedEntry>> {
        match self {
            Self::Journal(journal) => journal.list(),
            Self::Sqlite(sqlite) => sqlite.list().await,
        }
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        match self {
            Self::Journal(journal) => journal.delete(id).await,
            Self::Sqlite(sqlite) => sqlite.delete(id).await,
        }
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        match self {
            Self::Journal(journal) => journal.clear().await,
            Self::Sqlite(sqlite) => sqlite.clear().await,
        }
    }

    pub async fn count(&self) -> anyhow::Result<u64> {
        match self {
            Self::Journal(journal) => journal.count(),
            Self::Sqlite(sqlite) => sqlite.count().await,
        }
    }

    /// Optional filtered listing; `*` in `path_glob` spans any characters.
    pub async fn search(
        &self,
        method: Option<&str>,
        path_glob: Option<&str>,
    ) -> anyhow::Result<Vec<RecordedEntry>> {
        let entries = self.list().await?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                method.is_none_or(|method| entry.request.method.eq_ignore_ascii_case(method))
                    && path_glob.is_none_or(|glob| glob_matches(glob, &entry.request.path))
            })
            .collect())
    }

    /// Entries created within `[start_ms, end_ms]`, most recent first.
    pub async fn range(&self, start_ms: i64, end_ms: i64) -> anyhow::Result<Vec<RecordedEntry>> {
        let entries = self.list().await?;
        Ok(entries
            .into_iter()
            .filter(|entry| (start_ms..=end_ms).contains(&entry.created_at_unix_ms))
            .collect())
    }

    /// Releases the backing. Every operation after close fails; nothing
    /// silently reopens.
    pub fn close(&self) {
        match self {
            Self::Journal(journal) => journal.close(),
            Self::Sqlite(sqlite) => sqlite.close(),
        }
    }
}

/// The serialized journal document: `{"entries": [...]}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JournalDocument {
    pub entries: Vec<RecordedEntry>,
}

/// File-journal backing: the whole corpus lives in memory and is rewritten
/// to disk on every mutation. Suited to development-sized corpora.
#[derive(Debug, Clone)]
pub struct JournalStorage {
    inner: Arc<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    path: PathBuf,
    // Insertion-ordered; reads snapshot, mutations serialize on write_lock.
    entries: RwLock<Vec<RecordedEntry>>,
    write_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl JournalStorage {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create journal dir {}", parent.display()))?;
        }

        let entries = if path.exists() {
            let raw =
                fs::read(&path).with_context(|| format!("read journal {}", path.display()))?;
            let document: JournalDocument = serde_json::from_slice(&raw)
                .with_context(|| format!("parse journal {}", path.display()))?;
            document.entries
        } else {
            write_journal_document(&path, &[])
                .with_context(|| format!("initialize journal {}", path.display()))?;
            Vec::new()
        };

        Ok(Self {
            inner: Arc::new(JournalInner {
                path,
                entries: RwLock::new(entries),
                write_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn save(&self, entry: RecordedEntry) -> anyhow::Result<RecordedEntry> {
        self.mutate(move |entries| {
            entries.push(entry.clone());
            entry
        })
        .await
    }

    fn find(&self, method: &str, path: &str) -> anyhow::Result<Option<RecordedEntry>> {
        self.ensure_open()?;
        let entries = self.read_entries();
        // Entries are insertion-ordered and ids are monotonic, so the last
        // hit is the most recently created one.
        Ok(entries
            .iter()
            .rev()
            .find(|entry| entry.request.method == method && entry.request.path == path)
            .cloned())
    }

    fn find_by_id(&self, id: &str) -> anyhow::Result<Option<RecordedEntry>> {
        self.ensure_open()?;
        let entries = self.read_entries();
        Ok(entries.iter().find(|entry| entry.id == id).cloned())
    }

    fn list(&self) -> anyhow::Result<Vec<RecordedEntry>> {
        self.ensure_open()?;
        let mut snapshot = self.read_entries().clone();
        sort_most_recent_first(&mut snapshot);
        Ok(snapshot)
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_owned();
        self.mutate(move |entries| {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            entries.len() != before
        })
        .await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.mutate(|entries| entries.clear()).await
    }

    fn count(&self) -> anyhow::Result<u64> {
        self.ensure_open()?;
        Ok(self.read_entries().len() as u64)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }

    /// Applies a mutation to a copy of the corpus, flushes that copy, and
    /// commits it to memory only after the flush succeeded. A failed flush
    /// therefore leaves the previous in-memory view intact.
    async fn mutate<T: Send + 'static>(
        &self,
        apply: impl FnOnce(&mut Vec<RecordedEntry>) -> T + Send + 'static,
    ) -> anyhow::Result<T> {
        self.ensure_open()?;
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_open()?;

        let mut next = self.read_entries().clone();
        let output = apply(&mut next);

        let path = self.inner.path.clone();
        let to_flush = next.clone();
        tokio::task::spawn_blocking(move || write_journal_document(&path, &to_flush))
            .await
            .context("join journal flush task")?
            .with_context(|| format!("flush journal {}", self.inner.path.display()))?;

        *self
            .inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        Ok(output)
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, Vec<RecordedEntry>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            anyhow::bail!("storage is closed");
        }
        Ok(())
    }
}

fn write_journal_document(path: &Path, entries: &[RecordedEntry]) -> anyhow::Result<()> {
    let document = serde_json::json!({ "entries": entries });
    let raw = serde_json::to_vec_pretty(&document).context("serialize journal document")?;
    fs::write(path, raw).with_context(|| format!("write journal {}", path.display()))?;
    Ok(())
}

fn sort_most_recent_first(entries: &mut [RecordedEntry]) {
    entries.sort_by(|a, b| {
        b.created_at_unix_ms
            .cmp(&a.created_at_unix_ms)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Embedded relational backing over sqlite, one connection per blocking
/// operation, WAL enabled for concurrent read safety.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db_path: PathBuf,
    closed: Arc<AtomicBool>,
}

impl SqliteStorage {
    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let storage = Self {
            db_path,
            closed: Arc::new(AtomicBool::new(false)),
        };
        storage.init()?;
        Ok(storage)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> anyhow::Result<()> {
        let conn = open_connection(&self.db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
              id TEXT PRIMARY KEY,
              method TEXT NOT NULL,
              path TEXT NOT NULL,
              url TEXT NOT NULL,
              query_json TEXT NOT NULL,
              request_headers_json TEXT NOT NULL,
              request_body_json TEXT NOT NULL,
              request_id TEXT NOT NULL,
              request_captured_at_unix_ms INTEGER NOT NULL,
              response_status INTEGER NOT NULL,
              response_headers_json TEXT NOT NULL,
              response_body_json TEXT NOT NULL,
              response_captured_at_unix_ms INTEGER NOT NULL,
              created_at_unix_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS entries_method_path_idx ON entries(method, path);
            CREATE INDEX IF NOT EXISTS entries_created_at_idx ON entries(created_at_unix_ms);
            "#,
        )
        .context("create sqlite schema")?;
        Ok(())
    }

    async fn save(&self, entry: RecordedEntry) -> anyhow::Result<RecordedEntry> {
        self.blocking(move |conn| {
            insert_entry_blocking(conn, &entry)?;
            Ok(entry)
        })
        .await
    }

    async fn find(&self, method: &str, path: &str) -> anyhow::Result<Option<RecordedEntry>> {
        let method = method.to_owned();
        let path = path.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&select_entries_sql(
                    "WHERE method = ?1 AND path = ?2 ORDER BY created_at_unix_ms DESC, id DESC LIMIT 1",
                ))
                .context("prepare select entry by method and path")?;
            let mut rows = stmt
                .query(params![method, path])
                .context("query entry by method and path")?;
            match rows.next().context("iterate entry by method and path")? {
                Some(row) => Ok(Some(entry_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<RecordedEntry>> {
        let id = id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&select_entries_sql("WHERE id = ?1"))
                .context("prepare select entry by id")?;
            let mut rows = stmt.query(params![id]).context("query entry by id")?;
            match rows.next().context("iterate entry by id")? {
                Some(row) => Ok(Some(entry_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list(&self) -> anyhow::Result<Vec<RecordedEntry>> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&select_entries_sql(
                    "ORDER BY created_at_unix_ms DESC, id DESC",
                ))
                .context("prepare list entries")?;
            let mut rows = stmt.query([]).context("query list entries")?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next().context("iterate list entries")? {
                entries.push(entry_from_row(row)?);
            }
            Ok(entries)
        })
        .await
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_owned();
        self.blocking(move |conn| {
            let deleted = conn
                .execute("DELETE FROM entries WHERE id = ?1", params![id])
                .context("delete entry by id")?;
            Ok(deleted == 1)
        })
        .await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.blocking(move |conn| {
            conn.execute("DELETE FROM entries", [])
                .context("clear entries")?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> anyhow::Result<u64> {
        self.blocking(move |conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
                .context("count entries")?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    async fn blocking<T: Send + 'static>(
        &self,
        op: impl FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    ) -> anyhow::Result<T> {
        if self.closed.load(Ordering::Relaxed) {
            anyhow::bail!("storage is closed");
        }
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            op(&conn)
        })
        .await
        .context("join storage task")?
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn select_entries_sql(suffix: &str) -> String {
    format!(
        r#"
        SELECT
          id,
          method,
          path,
          url,
          query_json,
          request_headers_json,
          request_body_json,
          request_id,
          request_captured_at_unix_ms,
          response_status,
          response_headers_json,
          response_body_json,
          response_captured_at_unix_ms,
          created_at_unix_ms
        FROM entries
        {suffix}
        "#
    )
}

fn insert_entry_blocking(conn: &Connection, entry: &RecordedEntry) -> anyhow::Result<()> {
    let query_json =
        serde_json::to_string(&entry.request.query).context("serialize request query")?;
    let request_headers_json =
        serde_json::to_string(&entry.request.headers).context("serialize request headers")?;
    let request_body_json =
        serde_json::to_string(&entry.request.body).context("serialize request body")?;
    let response_headers_json =
        serde_json::to_string(&entry.response.headers).context("serialize response headers")?;
    let response_body_json =
        serde_json::to_string(&entry.response.body).context("serialize response body")?;

    conn.execute(
        r#"
        INSERT INTO entries (
          id,
          method,
          path,
          url,
          query_json,
          request_headers_json,
          request_body_json,
          request_id,
          request_captured_at_unix_ms,
          response_status,
          response_headers_json,
          response_body_json,
          response_captured_at_unix_ms,
          created_at_unix_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            entry.id,
            entry.request.method,
            entry.request.path,
            entry.request.url,
            query_json,
            request_headers_json,
            request_body_json,
            entry.request.id,
            entry.request.captured_at_unix_ms,
            i64::from(entry.response.status),
            response_headers_json,
            response_body_json,
            entry.response.captured_at_unix_ms,
            entry.created_at_unix_ms,
        ],
    )
    .context("insert entry")?;
    Ok(())
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> anyhow::Result<RecordedEntry> {
    let id = row.get::<_, String>(0).context("deserialize id")?;
    let method = row.get::<_, String>(1).context("deserialize method")?;
    let path = row.get::<_, String>(2).context("deserialize path")?;
    let url = row.get::<_, String>(3).context("deserialize url")?;
    let query_json = row.get::<_, String>(4).context("deserialize query_json")?;
    let request_headers_json = row
        .get::<_, String>(5)
        .context("deserialize request_headers_json")?;
    let request_body_json = row
        .get::<_, String>(6)
        .context("deserialize request_body_json")?;
    let request_id = row.get::<_, String>(7).context("deserialize request_id")?;
    let request_captured_at_unix_ms = row
        .get::<_, i64>(8)
        .context("deserialize request_captured_at_unix_ms")?;
    let response_status = row
        .get::<_, i64>(9)
        .context("deserialize response_status")?;
    let response_headers_json = row
        .get::<_, String>(10)
        .context("deserialize response_headers_json")?;
    let response_body_json = row
        .get::<_, String>(11)
        .context("deserialize response_body_json")?;
    let response_captured_at_unix_ms = row
        .get::<_, i64>(12)
        .context("deserialize response_captured_at_unix_ms")?;
    let created_at_unix_ms = row
        .get::<_, i64>(13)
        .context("deserialize created_at_unix_ms")?;

    Ok(RecordedEntry {
        id,
        request: RequestRecord {
            method,
            url,
            path,
            query: serde_json::from_str(&query_json).context("parse query_json")?,
            headers: serde_json::from_str(&request_headers_json)
                .context("parse request_headers_json")?,
            body: serde_json::from_str(&request_body_json).context("parse request_body_json")?,
            id: request_id,
            captured_at_unix_ms: request_captured_at_unix_ms,
        },
        response: ResponseRecord {
            status: u16::try_from(response_status).context("deserialize response_status")?,
            headers: serde_json::from_str(&response_headers_json)
                .context("parse response_headers_json")?,
            body: serde_json::from_str(&response_body_json).context("parse response_body_json")?,
            captured_at_unix_ms: response_captured_at_unix_ms,
        },
        created_at_unix_ms,
    })
}
