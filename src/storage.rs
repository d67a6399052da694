use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Name and size of one stored blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub name: String,
    pub size: u64,
}

/// Read-only view of a hierarchical blob store.
///
/// Paths use `/` separators. `exists` is true for a blob or for any path that
/// has blobs below it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, container: &str, path: &str) -> Result<bool>;

    /// Blobs whose name starts with `prefix`, in name order.
    fn list_by_prefix<'a>(
        &'a self,
        container: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<BlobDescriptor>>;

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>>;
}

fn is_at_or_below(name: &str, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    name == path
        || name
            .strip_prefix(path)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, container: &str, path: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        blobs.insert((container.to_string(), path.to_string()), data.into());
        Ok(())
    }

    fn snapshot_names(&self, container: &str, prefix: &str) -> Result<Vec<BlobDescriptor>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        Ok(blobs
            .iter()
            .filter(|((c, name), _)| c == container && name.starts_with(prefix))
            .map(|((_, name), data)| BlobDescriptor {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn exists(&self, container: &str, path: &str) -> Result<bool> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        Ok(blobs
            .keys()
            .any(|(c, name)| c == container && is_at_or_below(name, path)))
    }

    fn list_by_prefix<'a>(
        &'a self,
        container: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<BlobDescriptor>> {
        match self.snapshot_names(container, prefix) {
            Ok(names) => stream::iter(names.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        blobs
            .get(&(container.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("blob not found: {}/{}", container, path))
    }
}

/// Blobs mirrored to a local directory: `<root>/<container>/<path>`.
#[derive(Clone, Debug)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, container: &str, path: &str) -> Result<PathBuf> {
        let mut out = self.root.join(container);
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if part == ".." || part == "." {
                return Err(anyhow!("refusing relative path segment in {}", path));
            }
            out.push(part);
        }
        Ok(out)
    }

    fn walk(dir: &Path, rel: &str, out: &mut Vec<BlobDescriptor>) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            let meta = entry.metadata()?;
            if meta.is_dir() {
                Self::walk(&entry.path(), &child, out)?;
            } else {
                out.push(BlobDescriptor {
                    name: child,
                    size: meta.len(),
                });
            }
        }
        Ok(())
    }

    fn list_sync(&self, container: &str, prefix: &str) -> Result<Vec<BlobDescriptor>> {
        // start at the deepest directory the prefix fully names
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.resolve(container, dir_part)?;
        if !start.is_dir() {
            return Ok(Vec::new());
        }
        let mut all = Vec::new();
        Self::walk(&start, dir_part, &mut all)?;
        all.retain(|blob| blob.name.starts_with(prefix));
        Ok(all)
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn exists(&self, container: &str, path: &str) -> Result<bool> {
        let full = self.resolve(container, path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    fn list_by_prefix<'a>(
        &'a self,
        container: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<BlobDescriptor>> {
        let this = self.clone();
        let container = container.to_string();
        let prefix = prefix.to_string();
        stream::once(async move {
            tokio::task::spawn_blocking(move || this.list_sync(&container, &prefix))
                .await
                .map_err(|e| anyhow!("blob listing task failed: {}", e))?
        })
        .flat_map(|listed| match listed {
            Ok(blobs) => stream::iter(blobs.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        })
        .boxed()
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(container, path)?;
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("failed to read blob {}", full.display()))
    }
}

/// Blobs kept in a single SQLite table, keyed by `(container, path)`.
///
/// Queries run on the blocking pool; the connection is shared behind a mutex.
#[derive(Clone)]
pub struct SqliteBlobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBlobStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn put(&self, container: &str, path: &str, data: &[u8]) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO blobs(container, path, data) VALUES (?1, ?2, ?3)",
            params![container, path, data],
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            f(&guard)
        })
        .await
        .map_err(|e| anyhow!("sqlite task failed: {}", e))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| anyhow!("blob store lock poisoned"))
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS blobs (
          container TEXT NOT NULL,
          path TEXT NOT NULL,
          data BLOB NOT NULL,
          PRIMARY KEY (container, path)
        );
        "#,
    )?;
    Ok(())
}

fn sqlite_list(conn: &Connection, container: &str, prefix: &str) -> Result<Vec<BlobDescriptor>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT path, length(data) FROM blobs
        WHERE container = ?1 AND substr(path, 1, length(?2)) = ?2
        ORDER BY path ASC
        "#,
    )?;
    let mut rows = stmt.query(params![container, prefix])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let size: i64 = row.get(1)?;
        out.push(BlobDescriptor {
            name,
            size: size.max(0) as u64,
        });
    }
    Ok(out)
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn exists(&self, container: &str, path: &str) -> Result<bool> {
        let container = container.to_string();
        let path = path.trim_end_matches('/').to_string();
        self.with_conn(move |conn| {
            let hit: Option<i64> = conn
                .query_row(
                    r#"
                    SELECT 1 FROM blobs
                    WHERE container = ?1
                      AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')
                    LIMIT 1
                    "#,
                    params![container, path],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(hit.is_some())
        })
        .await
    }

    fn list_by_prefix<'a>(
        &'a self,
        container: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<BlobDescriptor>> {
        let container = container.to_string();
        let prefix = prefix.to_string();
        stream::once(self.with_conn(move |conn| sqlite_list(conn, &container, &prefix)))
            .flat_map(|listed| match listed {
                Ok(blobs) => stream::iter(blobs.into_iter().map(Ok)).boxed(),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .boxed()
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let container = container.to_string();
        let path = path.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT data FROM blobs WHERE container = ?1 AND path = ?2",
                params![container, path],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("blob not found: {}/{}", container, path))
        })
        .await
    }
}
