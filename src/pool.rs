//! Reference-counted pool of open store handles.
//!
//! The pool multiplexes concurrent "open the store at path P" requests onto a
//! single physical handle per path. Each [`Pool::get`] grants one logical
//! reference; [`Connection::close`] releases it. When the last reference is
//! released the handle is either closed immediately (zero
//! [`PoolConfig::expires`]) or left open for the grace window and reaped by
//! the eviction task, so bursty reacquisition of the same store does not
//! thrash the underlying file.
//!
//! Locking: the pool map is guarded by one mutex, each connection's refcount
//! and deadline by its own. Where both are needed the pool lock is taken
//! first; paths that cannot honor that order (the decrement in
//! [`Connection::close`]) re-check the refcount under both locks before
//! removing anything.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    default_error_handler, ErrorHandler, PoolConfig, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE,
};
use crate::store::{StorageEngine, StoreHandle};

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// Creating the store file's parent directory failed.
    #[error("create store directory {path}: {source}")]
    CreateDirectory {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    /// The engine failed to open the store.
    #[error("open store {path}: {err:#}")]
    Open { path: Utf8PathBuf, err: anyhow::Error },

    /// The engine failed to close the store.
    #[error("close store {path}: {err:#}")]
    CloseStore { path: Utf8PathBuf, err: anyhow::Error },

    /// Removal was requested for a path the pool does not know. Indicates an
    /// out-of-band mutation or a double removal, never a normal condition.
    #[error("unknown store {path}")]
    UnknownStore { path: Utf8PathBuf },

    /// The pool has been shut down. Shutdown is terminal.
    #[error("pool is closed")]
    Closed,
}

/// A pool of open store handles, keyed by file path.
///
/// Cloning is cheap and shares the same pool. Construction spawns the
/// eviction task, so a `Pool` must be created within a tokio runtime.
pub struct Pool<E: StorageEngine> {
    inner: Arc<PoolInner<E>>,
}

impl<E: StorageEngine> Clone for Pool<E> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<E: StorageEngine> {
    engine: E,
    file_mode: u32,
    dir_mode: u32,
    expires: Duration,
    error_handler: ErrorHandler,
    state: Mutex<PoolState<E>>,
    /// Coalescing "something became eligible for eviction" signal. Shared
    /// with the eviction task so the task does not keep the pool alive.
    sweep_notify: Arc<Notify>,
    cancel: CancellationToken,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

struct PoolState<E: StorageEngine> {
    stores: HashMap<Utf8PathBuf, Arc<Connection<E>>>,
    shut_down: bool,
}

/// One pooled store handle. Returned shared: every [`Pool::get`] for the same
/// path yields the same `Connection` with its reference count bumped.
///
/// Cloning the `Arc` does not take a logical reference; only `get` does, and
/// each taken reference must be released with exactly one [`close`](Connection::close).
pub struct Connection<E: StorageEngine> {
    handle: E::Handle,
    path: Utf8PathBuf,
    /// Non-owning: connections never extend the pool's lifetime.
    pool: Weak<PoolInner<E>>,
    state: Mutex<ConnState>,
}

struct ConnState {
    refcount: u64,
    /// Set only while `refcount == 0` and a grace window is configured;
    /// cleared whenever the connection is reacquired.
    close_deadline: Option<Instant>,
}

impl<E: StorageEngine> Pool<E> {
    /// Create a pool and spawn its eviction task.
    pub fn new(engine: E, config: PoolConfig) -> Self {
        let PoolConfig {
            file_mode,
            dir_mode,
            expires,
            error_handler,
        } = config;
        let inner = Arc::new(PoolInner {
            engine,
            file_mode: if file_mode == 0 { DEFAULT_FILE_MODE } else { file_mode },
            dir_mode: if dir_mode == 0 { DEFAULT_DIR_MODE } else { dir_mode },
            expires,
            error_handler: error_handler.unwrap_or_else(default_error_handler),
            state: Mutex::new(PoolState {
                stores: HashMap::new(),
                shut_down: false,
            }),
            sweep_notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            eviction_task: Mutex::new(None),
        });
        let task = tokio::spawn(eviction_loop(
            Arc::downgrade(&inner),
            Arc::clone(&inner.sweep_notify),
            inner.cancel.clone(),
            expires,
        ));
        *inner.eviction_task.lock() = Some(task);
        Pool { inner }
    }

    /// Get the connection for `path`, opening the store on first use.
    ///
    /// A hit bumps the reference count and cancels any pending deferred
    /// close. A miss creates the parent directory if absent, opens the store
    /// through the engine and inserts the connection with a count of one.
    /// The map lock is held across the open, which serializes all opens; at
    /// most one physical handle per path can ever exist.
    pub fn get(&self, path: &Utf8Path) -> Result<Arc<Connection<E>>, PoolError> {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(PoolError::Closed);
        }
        if let Some(conn) = state.stores.get(path) {
            conn.acquire();
            return Ok(Arc::clone(conn));
        }

        if let Some(parent) = path.parent() {
            match std::fs::metadata(parent.as_std_path()) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    create_dir_all(parent, self.inner.dir_mode).map_err(|source| {
                        PoolError::CreateDirectory {
                            path: parent.to_owned(),
                            source,
                        }
                    })?;
                }
                Err(source) => {
                    return Err(PoolError::CreateDirectory {
                        path: parent.to_owned(),
                        source,
                    });
                }
            }
        }

        let handle = self
            .inner
            .engine
            .open(path, self.inner.file_mode)
            .map_err(|err| PoolError::Open {
                path: path.to_owned(),
                err,
            })?;
        info!(%path, "opened store");
        let conn = Arc::new(Connection {
            handle,
            path: path.to_owned(),
            pool: Arc::downgrade(&self.inner),
            state: Mutex::new(ConnState {
                refcount: 1,
                close_deadline: None,
            }),
        });
        state.stores.insert(path.to_owned(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Whether a store for `path` is currently open, actively referenced or
    /// within its grace window. Does not affect reference counts.
    pub fn has(&self, path: &Utf8Path) -> bool {
        self.inner.state.lock().stores.contains_key(path)
    }

    /// Number of open stores.
    pub fn len(&self) -> usize {
        self.inner.state.lock().stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut the pool down: close every store regardless of outstanding
    /// references, routing close errors to the error handler, and stop the
    /// eviction task.
    ///
    /// Shutdown is terminal: after the first `close` returns, [`Pool::get`]
    /// fails with [`PoolError::Closed`]; repeated `close` calls are no-ops.
    /// Callers still holding a connection observe errors from its store on
    /// their next operation.
    pub async fn close(&self) {
        let stores = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.stores)
        };
        for (path, conn) in stores {
            debug!(%path, "closing store on pool shutdown");
            if let Err(err) = conn.handle.close() {
                self.inner
                    .handle_error(PoolError::CloseStore { path, err });
            }
        }
        self.inner.cancel.cancel();
        let task = self.inner.eviction_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "eviction task terminated abnormally");
            }
        }
        info!("store pool shut down");
    }
}

impl<E: StorageEngine> Drop for PoolInner<E> {
    fn drop(&mut self) {
        // A pool dropped without close() must not strand the eviction task
        // on its notify wait.
        self.cancel.cancel();
    }
}

impl<E: StorageEngine> PoolInner<E> {
    fn handle_error(&self, err: PoolError) {
        (self.error_handler)(err);
    }

    /// Remove `path` from the map and close its handle. Caller holds the map
    /// lock via `state`. An absent path is an internal consistency error.
    fn remove_locked(state: &mut PoolState<E>, path: &Utf8Path) -> Result<(), PoolError> {
        let conn = state
            .stores
            .remove(path)
            .ok_or_else(|| PoolError::UnknownStore {
                path: path.to_owned(),
            })?;
        conn.handle.close().map_err(|err| PoolError::CloseStore {
            path: path.to_owned(),
            err,
        })
    }

    /// Close every connection whose grace window has elapsed and whose
    /// refcount is still zero. The refcount is re-checked under the same
    /// locks `get` uses, so a reacquired connection always survives.
    fn sweep(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<Utf8PathBuf> = state
            .stores
            .values()
            .filter(|conn| {
                let s = conn.state.lock();
                s.refcount == 0 && s.close_deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|conn| conn.path.clone())
            .collect();
        for path in expired {
            debug!(%path, "closing expired store");
            if let Err(err) = Self::remove_locked(&mut state, &path) {
                self.handle_error(err);
            }
        }
    }
}

impl<E: StorageEngine> Connection<E> {
    /// The open store handle.
    pub fn store(&self) -> &E::Handle {
        &self.handle
    }

    /// The path this connection was pooled under.
    pub fn key(&self) -> &Utf8Path {
        &self.path
    }

    /// Current number of outstanding logical references. Diagnostics only;
    /// the value may be stale by the time the caller looks at it.
    pub fn refcount(&self) -> u64 {
        self.state.lock().refcount
    }

    /// Release one logical reference.
    ///
    /// When the count reaches zero the store is closed immediately if the
    /// pool has no grace window, otherwise a close deadline is armed and the
    /// eviction task is signalled; a `get` before the deadline elapses keeps
    /// the store open.
    pub fn close(&self) {
        let reached_zero = {
            let mut s = self.state.lock();
            if s.refcount == 0 {
                warn!(path = %self.path, "close of an already-released store connection");
                return;
            }
            s.refcount -= 1;
            s.refcount == 0
        };
        if !reached_zero {
            return;
        }

        let Some(pool) = self.pool.upgrade() else {
            // The pool is gone; close the handle directly. Nothing to remove
            // and nowhere to route a failure but the log.
            if let Err(err) = self.handle.close() {
                warn!(path = %self.path, error = %format!("{err:#}"), "close store after pool drop");
            }
            return;
        };

        if pool.expires.is_zero() {
            let result = {
                let mut state = pool.state.lock();
                // A racing get may have taken a new reference between our
                // decrement and this lock; it wins.
                if self.state.lock().refcount > 0 {
                    return;
                }
                if state.shut_down {
                    // Shutdown already closed the handle.
                    return;
                }
                PoolInner::remove_locked(&mut state, &self.path)
            };
            if let Err(err) = result {
                pool.handle_error(err);
            }
            return;
        }

        {
            let mut s = self.state.lock();
            // Re-check: a racing get may have resurrected the connection.
            if s.refcount == 0 {
                s.close_deadline = Some(Instant::now() + pool.expires);
                debug!(path = %self.path, expires = ?pool.expires, "store idle, deferred close armed");
            }
        }
        pool.sweep_notify.notify_one();
    }

    /// Take one more logical reference and cancel any pending deferred
    /// close. Called by `get` with the pool lock held.
    fn acquire(&self) {
        let mut s = self.state.lock();
        s.close_deadline = None;
        s.refcount += 1;
    }

    #[cfg(test)]
    pub(crate) fn close_deadline(&self) -> Option<Instant> {
        self.state.lock().close_deadline
    }
}

impl<E: StorageEngine> std::fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("refcount", &s.refcount)
            .field("close_deadline", &s.close_deadline)
            .finish_non_exhaustive()
    }
}

/// Waits for an eligibility signal, sleeps out the grace window, then sweeps
/// the whole map. Signals coalesce: a handle that expires while a sweep is
/// already pending is caught by that sweep's full re-check. Holds only a weak
/// pool reference so a pool dropped without `close` does not leak the loop.
async fn eviction_loop<E: StorageEngine>(
    pool: Weak<PoolInner<E>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    expires: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = notify.notified() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(expires) => {}
        }
        let Some(pool) = pool.upgrade() else { return };
        pool.sweep();
    }
}

fn create_dir_all(path: &Utf8Path, mode: u32) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path.as_std_path())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use camino_tempfile::Utf8TempDir;

    use super::*;
    use crate::store::mock::{MockEngine, MockStats};

    fn mock_pool(config: PoolConfig) -> (Pool<MockEngine>, Arc<MockStats>, Utf8TempDir) {
        let engine = MockEngine::default();
        let stats = Arc::clone(&engine.stats);
        let dir = camino_tempfile::tempdir().unwrap();
        (Pool::new(engine, config), stats, dir)
    }

    #[tokio::test]
    async fn config_defaults_applied() {
        let (pool, _, _dir) = mock_pool(PoolConfig::default());
        assert_eq!(pool.inner.file_mode, DEFAULT_FILE_MODE);
        assert_eq!(pool.inner.dir_mode, DEFAULT_DIR_MODE);
        assert_eq!(pool.inner.expires, Duration::ZERO);
        assert!(pool.is_empty());
        pool.close().await;
    }

    #[tokio::test]
    async fn get_reuses_one_physical_handle() {
        let (pool, stats, dir) = mock_pool(PoolConfig::default());
        let path = dir.path().join("a.db");

        let conn = pool.get(&path).unwrap();
        assert_eq!(conn.refcount(), 1);
        assert_eq!(conn.key(), path);
        let again = pool.get(&path).unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(conn.refcount(), 2);
        pool.get(&path).unwrap();
        assert_eq!(conn.refcount(), 3);

        assert_eq!(stats.opens.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
        assert!(pool.has(&path));

        conn.close();
        assert_eq!(conn.refcount(), 2);
        conn.close();
        conn.close();
        assert_eq!(conn.refcount(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn distinct_paths_get_distinct_handles() {
        let (pool, stats, dir) = mock_pool(PoolConfig::default());
        let a = pool.get(&dir.path().join("a.db")).unwrap();
        let b = pool.get(&dir.path().join("b.db")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(stats.opens.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn zero_expiry_closes_synchronously() {
        let (pool, stats, dir) = mock_pool(PoolConfig::default());
        let path = dir.path().join("a.db");

        let conn = pool.get(&path).unwrap();
        conn.close();

        // close() returned: the store is already gone and closed
        assert!(!pool.has(&path));
        assert!(pool.is_empty());
        assert!(!conn.store().is_open());
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn creates_missing_parent_directory() {
        let (pool, _, dir) = mock_pool(PoolConfig::default());
        let path = dir.path().join("nested/deeper/a.db");
        pool.get(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweeps_idle_connection() {
        let expires = Duration::from_secs(5);
        let (pool, stats, dir) = mock_pool(PoolConfig {
            expires,
            ..PoolConfig::default()
        });
        let path = dir.path().join("a.db");

        let conn = pool.get(&path).unwrap();
        conn.close();
        assert_eq!(conn.refcount(), 0);
        assert!(conn.close_deadline().is_some());
        // still pooled during the grace window
        assert!(pool.has(&path));
        assert!(conn.store().is_open());

        tokio::time::sleep(expires + Duration::from_millis(100)).await;

        assert!(!pool.has(&path));
        assert!(!conn.store().is_open());
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn get_before_expiry_cancels_pending_close() {
        let expires = Duration::from_secs(5);
        let (pool, stats, dir) = mock_pool(PoolConfig {
            expires,
            ..PoolConfig::default()
        });
        let path = dir.path().join("a.db");

        let conn = pool.get(&path).unwrap();
        conn.close();
        assert!(conn.close_deadline().is_some());

        tokio::time::sleep(expires / 2).await;
        let conn = pool.get(&path).unwrap();
        assert!(conn.close_deadline().is_none());
        assert_eq!(conn.refcount(), 1);

        // the already-signalled sweep runs and must leave the store alone
        tokio::time::sleep(expires * 2).await;
        assert!(pool.has(&path));
        assert!(conn.store().is_open());
        assert_eq!(stats.opens.load(Ordering::SeqCst), 1);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 0);
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_catches_all_expired_entries() {
        let expires = Duration::from_secs(5);
        let (pool, stats, dir) = mock_pool(PoolConfig {
            expires,
            ..PoolConfig::default()
        });

        let a = pool.get(&dir.path().join("a.db")).unwrap();
        let b = pool.get(&dir.path().join("b.db")).unwrap();
        a.close();
        // b expires slightly later; the sweep woken for a re-checks the whole
        // map, the one woken for b catches the rest
        tokio::time::sleep(Duration::from_secs(1)).await;
        b.close();

        tokio::time::sleep(expires * 2).await;
        assert!(pool.is_empty());
        assert_eq!(stats.closes.load(Ordering::SeqCst), 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn pool_close_is_terminal_and_idempotent() {
        let (pool, stats, dir) = mock_pool(PoolConfig::default());
        let a = pool.get(&dir.path().join("a.db")).unwrap();
        let _b = pool.get(&dir.path().join("b.db")).unwrap();
        // a still has an outstanding reference; shutdown wins
        assert_eq!(a.refcount(), 1);

        pool.close().await;
        assert!(pool.is_empty());
        assert!(!a.store().is_open());
        assert_eq!(stats.closes.load(Ordering::SeqCst), 2);
        assert!(matches!(
            pool.get(&dir.path().join("c.db")),
            Err(PoolError::Closed)
        ));

        // repeated close is a no-op
        pool.close().await;
        assert_eq!(stats.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_failure_reaches_error_handler_once() {
        let seen: Arc<Mutex<Vec<PoolError>>> = Arc::default();
        let handler_seen = Arc::clone(&seen);
        let engine = MockEngine::default();
        let dir = camino_tempfile::tempdir().unwrap();
        let pool = Pool::new(
            engine,
            PoolConfig {
                error_handler: Some(Box::new(move |err| handler_seen.lock().push(err))),
                ..PoolConfig::default()
            },
        );
        let path = dir.path().join("a.db");

        let conn = pool.get(&path).unwrap();
        // close the store out-of-band; the pool's own close then fails
        conn.store().close().unwrap();
        conn.close();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], PoolError::CloseStore { .. }));
        drop(seen);
        pool.close().await;
    }

    #[tokio::test]
    async fn shutdown_close_failures_do_not_stop_other_keys() {
        let seen: Arc<Mutex<Vec<PoolError>>> = Arc::default();
        let handler_seen = Arc::clone(&seen);
        let engine = MockEngine::default();
        let stats = Arc::clone(&engine.stats);
        let dir = camino_tempfile::tempdir().unwrap();
        let pool = Pool::new(
            engine,
            PoolConfig {
                error_handler: Some(Box::new(move |err| handler_seen.lock().push(err))),
                ..PoolConfig::default()
            },
        );

        let broken = pool.get(&dir.path().join("broken.db")).unwrap();
        let _fine = pool.get(&dir.path().join("fine.db")).unwrap();
        broken.store().close().unwrap();

        pool.close().await;
        // the broken store's failure is reported, the other store still closed
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 2);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn directory_creation_failure_is_returned_to_caller() {
        let (pool, stats, dir) = mock_pool(PoolConfig::default());
        // a regular file where a directory component should go
        let obstruction = dir.path().join("not-a-dir");
        std::fs::write(obstruction.as_std_path(), b"").unwrap();

        let err = pool.get(&obstruction.join("sub/a.db")).unwrap_err();
        assert!(matches!(err, PoolError::CreateDirectory { .. }));
        assert_eq!(stats.opens.load(Ordering::SeqCst), 0);
        assert!(pool.is_empty());
        pool.close().await;
    }

    #[tokio::test]
    async fn open_failure_is_returned_to_caller() {
        struct FailingEngine;
        struct NeverHandle(Utf8PathBuf);
        impl StoreHandle for NeverHandle {
            fn close(&self) -> anyhow::Result<()> {
                Ok(())
            }
            fn path(&self) -> &Utf8Path {
                &self.0
            }
            fn is_open(&self) -> bool {
                false
            }
        }
        impl StorageEngine for FailingEngine {
            type Handle = NeverHandle;
            fn open(&self, path: &Utf8Path, _file_mode: u32) -> anyhow::Result<NeverHandle> {
                anyhow::bail!("no such engine backing for {path}")
            }
        }

        let dir = camino_tempfile::tempdir().unwrap();
        let pool = Pool::new(FailingEngine, PoolConfig::default());
        let err = pool.get(&dir.path().join("a.db")).unwrap_err();
        assert!(matches!(err, PoolError::Open { .. }));
        // the failed open left nothing behind
        assert!(pool.is_empty());
        pool.close().await;
    }
}
