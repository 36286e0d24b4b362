//! The storage engine seam.
//!
//! The pool multiplexes callers onto open handles; what a handle *is* comes
//! from a [`StorageEngine`] implementation. The engine is trusted to tolerate
//! being opened at most once per path at a time and to be closeable from any
//! thread. [`RedbEngine`] is the default implementation, backed by the `redb`
//! single-file embedded store.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

/// Opens store handles for the pool.
///
/// Engine-specific tuning (cache sizes and the like) lives inside the engine
/// value; the pool passes it through opaquely.
pub trait StorageEngine: Send + Sync + 'static {
    type Handle: StoreHandle + Send + Sync + 'static;

    /// Open or create the store file at `path`. `file_mode` carries the
    /// configured permission bits for newly created files; engines on
    /// platforms without unix permissions may ignore it.
    fn open(&self, path: &Utf8Path, file_mode: u32) -> anyhow::Result<Self::Handle>;
}

/// One open store. Obtained from [`StorageEngine::open`], closed exactly once
/// by the pool (or forcibly at shutdown).
pub trait StoreHandle {
    /// Close the store, flushing whatever the engine buffers. Safe to call
    /// more than once; engines decide whether a repeated close is an error.
    fn close(&self) -> anyhow::Result<()>;

    /// The path this handle was opened from.
    fn path(&self) -> &Utf8Path;

    /// Whether the underlying store is still open.
    fn is_open(&self) -> bool;
}

/// Default engine: `redb`, a single-file embedded B-tree store.
#[derive(Debug, Clone, Default)]
pub struct RedbEngine {
    cache_size_bytes: Option<usize>,
}

impl RedbEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tune redb's in-memory cache for every store opened by this engine.
    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size_bytes = Some(bytes);
        self
    }
}

impl StorageEngine for RedbEngine {
    type Handle = RedbHandle;

    fn open(&self, path: &Utf8Path, file_mode: u32) -> anyhow::Result<RedbHandle> {
        let created = !path.as_std_path().exists();
        let mut builder = redb::Builder::new();
        if let Some(bytes) = self.cache_size_bytes {
            builder.set_cache_size(bytes);
        }
        let db = builder
            .create(path.as_std_path())
            .with_context(|| format!("open store {path}"))?;
        // the configured mode applies to files this open created, an
        // existing store keeps whatever it had
        #[cfg(unix)]
        if created {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                path.as_std_path(),
                std::fs::Permissions::from_mode(file_mode),
            )
            .with_context(|| format!("set permissions {file_mode:#o} on {path}"))?;
        }
        #[cfg(not(unix))]
        let _ = (created, file_mode);
        Ok(RedbHandle {
            path: path.to_owned(),
            db: RwLock::new(Some(db)),
        })
    }
}

/// An open redb database. Access after [`StoreHandle::close`] fails with an
/// error rather than panicking, so callers that outlive the pool observe a
/// reported error on their next operation.
pub struct RedbHandle {
    path: Utf8PathBuf,
    db: RwLock<Option<redb::Database>>,
}

impl RedbHandle {
    /// Borrow the open database to run transactions against it.
    pub fn database(&self) -> anyhow::Result<MappedRwLockReadGuard<'_, redb::Database>> {
        RwLockReadGuard::try_map(self.db.read(), Option::as_ref)
            .map_err(|_| anyhow::anyhow!("store {} is closed", self.path))
    }
}

impl StoreHandle for RedbHandle {
    fn close(&self) -> anyhow::Result<()> {
        // Dropping the database flushes and releases the file lock. A second
        // close finds the slot empty and is a no-op.
        let _db = self.db.write().take();
        Ok(())
    }

    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.db.read().is_some()
    }
}

impl std::fmt::Debug for RedbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbHandle")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory engine for pool tests: counts physical opens and closes,
    //! errors on a repeated close so out-of-band closes are caught.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::{StorageEngine, StoreHandle};

    #[derive(Default)]
    pub(crate) struct MockStats {
        pub(crate) opens: AtomicUsize,
        pub(crate) closes: AtomicUsize,
    }

    #[derive(Clone, Default)]
    pub(crate) struct MockEngine {
        pub(crate) stats: Arc<MockStats>,
    }

    pub(crate) struct MockHandle {
        path: Utf8PathBuf,
        open: AtomicBool,
        stats: Arc<MockStats>,
    }

    impl StorageEngine for MockEngine {
        type Handle = MockHandle;

        fn open(&self, path: &Utf8Path, _file_mode: u32) -> anyhow::Result<MockHandle> {
            self.stats.opens.fetch_add(1, Ordering::SeqCst);
            Ok(MockHandle {
                path: path.to_owned(),
                open: AtomicBool::new(true),
                stats: Arc::clone(&self.stats),
            })
        }
    }

    impl StoreHandle for MockHandle {
        fn close(&self) -> anyhow::Result<()> {
            if !self.open.swap(false, Ordering::SeqCst) {
                anyhow::bail!("store {} already closed", self.path);
            }
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn path(&self) -> &Utf8Path {
            &self.path
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redb_open_close_reopen() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let engine = RedbEngine::new();
        let handle = engine.open(&path, 0o644).unwrap();
        assert!(path.exists());
        assert!(handle.is_open());
        assert_eq!(handle.path(), path);
        handle.database().unwrap();

        handle.close().unwrap();
        assert!(!handle.is_open());
        assert!(handle.database().is_err());
        // repeated close is a no-op for redb
        handle.close().unwrap();

        // the file lock is released, the store can be opened again
        let handle = engine.open(&path, 0o644).unwrap();
        assert!(handle.is_open());
        handle.close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn redb_applies_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let handle = RedbEngine::new().open(&path, 0o600).unwrap();
        handle.close().unwrap();

        let mode = std::fs::metadata(path.as_std_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
