//! SQLite-backed metric store.
//!
//! Uniqueness is enforced by a `(name, type)` constraint. Every operation
//! leases one pooled connection and runs the blocking SQLite calls on the
//! blocking thread pool. Transactions pin their connection until commit or
//! rollback and start with `BEGIN IMMEDIATE`, so concurrent writers queue on
//! the database write lock.

use super::{MetricStore, StoreTx};
use crate::core::types::storage_key;
use crate::core::{Metric, MetricKind, MetricValue, Result, TallyError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// DDL for the metrics table.
const METRICS_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS metrics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    type        TEXT NOT NULL,
    value       REAL,
    delta       INTEGER,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    deleted_at  TEXT,
    UNIQUE (name, type)
);
";

const UPSERT_SQL: &str = "INSERT INTO metrics (name, type, value, delta, created_at, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
     ON CONFLICT (name, type) DO UPDATE SET \
     value = excluded.value, delta = excluded.delta, updated_at = excluded.updated_at";

const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened at startup
    pub min_connections: usize,
    /// Upper bound of leased connections
    pub max_connections: usize,
    /// How long a connection waits on a locked database
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

struct PoolInner {
    dsn: String,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

impl PoolInner {
    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.dsn)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(METRICS_SCHEMA)?;
        Ok(conn)
    }
}

/// Returns true if every connection to `dsn` gets its own private database.
fn is_private_dsn(dsn: &str) -> bool {
    dsn.is_empty() || dsn == ":memory:" || dsn.contains("mode=memory")
}

/// Bounded pool of SQLite connections.
#[derive(Clone)]
pub struct SqlitePool {
    inner: Arc<PoolInner>,
}

/// A connection leased from the pool, returned on drop.
struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| TallyError::storage("connection lost by a previous failure"))?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await?;
        self.conn = Some(conn);
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

impl SqlitePool {
    /// Open the pool and eagerly create `min_connections` connections.
    ///
    /// In-memory and temporary databases live inside their connection, so
    /// the pool keeps exactly one and callers queue for it.
    pub fn open(dsn: &str, config: &PoolConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(TallyError::config("pool needs at least one connection"));
        }
        let (min_connections, max_connections) = if is_private_dsn(dsn) {
            tracing::info!(dsn, "In-memory SQLite database, using a single connection");
            (1, 1)
        } else {
            (config.min_connections, config.max_connections)
        };
        let inner = Arc::new(PoolInner {
            dsn: dsn.to_string(),
            busy_timeout: config.busy_timeout,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections)),
        });
        let warm = min_connections.min(max_connections);
        for _ in 0..warm {
            let conn = inner.open()?;
            inner.idle.lock().push(conn);
        }
        Ok(Self { inner })
    }

    async fn acquire(&self) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| TallyError::storage("connection pool closed"))?;
        let idle = self.inner.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                let inner = Arc::clone(&self.inner);
                tokio::task::spawn_blocking(move || inner.open()).await??
            },
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            permit: Some(permit),
        })
    }
}

fn kind_from_sql(raw: &str) -> Result<MetricKind> {
    raw.parse()
}

fn row_to_metric(name: String, kind: &str, value: Option<f64>, delta: Option<i64>) -> Result<Metric> {
    let value = match kind_from_sql(kind)? {
        MetricKind::Gauge => MetricValue::Gauge(
            value.ok_or_else(|| TallyError::storage(format!("gauge {name} has NULL value")))?,
        ),
        MetricKind::Counter => MetricValue::Counter(
            delta.ok_or_else(|| TallyError::storage(format!("counter {name} has NULL delta")))?,
        ),
    };
    Ok(Metric { name, value })
}

fn columns(metric: &Metric) -> (Option<f64>, Option<i64>) {
    match metric.value {
        MetricValue::Gauge(v) => (Some(v), None),
        MetricValue::Counter(d) => (None, Some(d)),
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn insert_row(conn: &Connection, metric: &Metric) -> Result<()> {
    let (value, delta) = columns(metric);
    let ts = now();
    conn.execute(
        "INSERT INTO metrics (name, type, value, delta, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![metric.name, metric.kind().as_str(), value, delta, ts],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            TallyError::AlreadyExists(metric.key())
        } else {
            TallyError::from(e)
        }
    })?;
    Ok(())
}

fn select_row(conn: &Connection, kind: MetricKind, name: &str) -> Result<Metric> {
    let row = conn
        .query_row(
            "SELECT name, type, value, delta FROM metrics \
             WHERE name = ?1 AND type = ?2 AND deleted_at IS NULL",
            params![name, kind.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((name, kind, value, delta)) => row_to_metric(name, &kind, value, delta),
        None => Err(TallyError::NotFound(storage_key(kind, name))),
    }
}

fn update_row(conn: &Connection, metric: &Metric) -> Result<()> {
    let (value, delta) = columns(metric);
    let changed = conn.execute(
        "UPDATE metrics SET value = ?3, delta = ?4, updated_at = ?5 \
         WHERE name = ?1 AND type = ?2 AND deleted_at IS NULL",
        params![metric.name, metric.kind().as_str(), value, delta, now()],
    )?;
    if changed == 0 {
        return Err(TallyError::NotFound(metric.key()));
    }
    Ok(())
}

fn upsert_rows(conn: &Connection, metrics: &[Metric]) -> Result<()> {
    let mut stmt = conn.prepare_cached(UPSERT_SQL)?;
    let ts = now();
    for metric in metrics {
        let (value, delta) = columns(metric);
        stmt.execute(params![metric.name, metric.kind().as_str(), value, delta, ts])?;
    }
    Ok(())
}

fn select_all(conn: &Connection) -> Result<Vec<Metric>> {
    let mut stmt = conn.prepare(
        "SELECT name, type, value, delta FROM metrics \
         WHERE deleted_at IS NULL ORDER BY name ASC, type ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<f64>>(2)?,
            row.get::<_, Option<i64>>(3)?,
        ))
    })?;

    let mut result = Vec::new();
    for row in rows {
        let (name, kind, value, delta) = row?;
        result.push(row_to_metric(name, &kind, value, delta)?);
    }
    Ok(result)
}

/// Relational metric store on SQLite.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("dsn", &self.pool.inner.dsn)
            .finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Open the database. Every pooled connection bootstraps the schema.
    pub async fn open(dsn: &str, config: &PoolConfig) -> Result<Self> {
        let pool = SqlitePool::open(dsn, config)?;
        drop(pool.acquire().await?);
        tracing::info!(dsn, "SQLite metric store ready");
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl MetricStore for SqliteStorage {
    async fn create(&self, metric: &Metric) -> Result<()> {
        let metric = metric.clone();
        self.pool.acquire().await?.run(move |c| insert_row(c, &metric)).await
    }

    async fn read(&self, kind: MetricKind, name: &str) -> Result<Metric> {
        let name = name.to_string();
        self.pool.acquire().await?.run(move |c| select_row(c, kind, &name)).await
    }

    async fn update(&self, metric: &Metric) -> Result<()> {
        let metric = metric.clone();
        self.pool.acquire().await?.run(move |c| update_row(c, &metric)).await
    }

    async fn get_all(&self) -> Result<Vec<Metric>> {
        self.pool.acquire().await?.run(|c| select_all(c)).await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let mut conn = self.pool.acquire().await?;
        conn.run(|c| {
            c.execute_batch("BEGIN IMMEDIATE")?;
            Ok(())
        })
        .await?;
        Ok(Box::new(SqliteTx {
            conn,
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<()> {
        let probe = async {
            self.pool
                .acquire()
                .await?
                .run(|c| {
                    c.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                    Ok(())
                })
                .await
        };
        tokio::time::timeout(PING_TIMEOUT, probe)
            .await
            .map_err(|_| TallyError::Timeout {
                timeout_ms: u64::try_from(PING_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Transaction pinned to one pooled connection.
struct SqliteTx {
    conn: PooledConnection,
    finished: bool,
}

#[async_trait::async_trait]
impl StoreTx for SqliteTx {
    async fn create(&mut self, metric: &Metric) -> Result<()> {
        let metric = metric.clone();
        self.conn.run(move |c| insert_row(c, &metric)).await
    }

    async fn read(&mut self, kind: MetricKind, name: &str) -> Result<Metric> {
        let name = name.to_string();
        self.conn.run(move |c| select_row(c, kind, &name)).await
    }

    async fn update(&mut self, metric: &Metric) -> Result<()> {
        let metric = metric.clone();
        self.conn.run(move |c| update_row(c, &metric)).await
    }

    async fn bulk_create_or_update(&mut self, metrics: &[Metric]) -> Result<()> {
        let metrics = metrics.to_vec();
        self.conn.run(move |c| upsert_rows(c, &metrics)).await
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn
            .run(|c| {
                c.execute_batch("COMMIT")?;
                Ok(())
            })
            .await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn
            .run(|c| {
                c.execute_batch("ROLLBACK")?;
                Ok(())
            })
            .await
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(conn) = self.conn.conn.take() else {
            return;
        };
        // The permit is held until the rollback lands.
        let permit = self.conn.permit.take();
        let pool = Arc::clone(&self.conn.pool);
        let rollback = move || {
            match conn.execute_batch("ROLLBACK") {
                Ok(()) => pool.idle.lock().push(conn),
                Err(e) => tracing::warn!("Rollback of abandoned transaction failed: {}", e),
            }
            drop(permit);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(rollback);
            },
            Err(_) => rollback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, SqliteStorage) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.db");
        let storage = SqliteStorage::open(path.to_str().unwrap(), &PoolConfig::default())
            .await
            .unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_unique_violation_maps_to_already_exists() {
        let (_dir, store) = open_temp().await;
        store.create(&Metric::counter("hits", 1)).await.unwrap();
        let err = store.create(&Metric::counter("hits", 2)).await.unwrap_err();
        assert!(matches!(err, TallyError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_no_rows_maps_to_not_found() {
        let (_dir, store) = open_temp().await;
        assert!(matches!(
            store.read(MetricKind::Gauge, "missing").await,
            Err(TallyError::NotFound(_))
        ));
        assert!(matches!(
            store.update(&Metric::gauge("missing", 1.0)).await,
            Err(TallyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_all_sorted_by_name() {
        let (_dir, store) = open_temp().await;
        store
            .bulk_create_or_update(&[
                Metric::gauge("zeta", 1.0),
                Metric::counter("alpha", 2),
                Metric::gauge("mid", 0.25),
            ])
            .await
            .unwrap();
        let names: Vec<_> = store
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_on_conflict() {
        let (_dir, store) = open_temp().await;
        store.create(&Metric::gauge("temp", 1.5)).await.unwrap();
        store.bulk_create_or_update(&[Metric::gauge("temp", -0.5)]).await.unwrap();
        assert_eq!(
            store.read(MetricKind::Gauge, "temp").await.unwrap(),
            Metric::gauge("temp", -0.5)
        );
    }

    #[tokio::test]
    async fn test_rollback_discards_transaction() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        tx.create(&Metric::counter("c", 1)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_rolled_back() {
        let (_dir, store) = open_temp().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.create(&Metric::counter("c", 1)).await.unwrap();
        }
        assert!(store.get_all().await.unwrap().is_empty());
        store.create(&Metric::counter("c", 2)).await.unwrap();
    }

    #[test]
    fn test_private_dsn_detection() {
        assert!(is_private_dsn(":memory:"));
        assert!(is_private_dsn(""));
        assert!(is_private_dsn("file:tally?mode=memory"));
        assert!(!is_private_dsn("/var/lib/tally/metrics.db"));
    }

    #[tokio::test]
    async fn test_in_memory_reader_waits_for_transaction() {
        let store = SqliteStorage::open(":memory:", &PoolConfig::default()).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.create(&Metric::counter("c", 1)).await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.get_all().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        tx.commit().await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), vec![Metric::counter("c", 1)]);
    }

    #[tokio::test]
    async fn test_dropped_in_memory_transaction_returns_connection() {
        let store = SqliteStorage::open(":memory:", &PoolConfig::default()).await.unwrap();
        store.create(&Metric::gauge("kept", 1.0)).await.unwrap();
        {
            let mut tx = store.begin().await.unwrap();
            tx.create(&Metric::counter("c", 1)).await.unwrap();
        }
        store.create(&Metric::counter("c", 2)).await.unwrap();
        assert_eq!(
            store.get_all().await.unwrap(),
            vec![Metric::counter("c", 2), Metric::gauge("kept", 1.0)]
        );
    }

    #[tokio::test]
    async fn test_ping() {
        let (_dir, store) = open_temp().await;
        assert!(store.ping().await.is_ok());
    }
}
