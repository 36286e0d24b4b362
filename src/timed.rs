//! Time-bucketed store rotation on top of the pool.
//!
//! A [`TimedPool`] owns a base directory, a [`Period`] and a [`Pool`]. A
//! request for timestamp `t` resolves to the series key of `t`'s bucket, then
//! to the bucket's store file under the base directory, then to a pooled
//! connection for that file. Connections remember their series, so a caller
//! can walk to the chronologically adjacent bucket without recomputing
//! anything from wall-clock time.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};

use crate::config::PoolConfig;
use crate::period::{Period, PeriodError};
use crate::pool::{Connection, Pool, PoolError};
use crate::store::StorageEngine;

#[derive(thiserror::Error, Debug)]
pub enum TimedPoolError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Period(#[from] PeriodError),
}

/// A pool of per-bucket stores under one base directory.
///
/// Cloning is cheap and shares the same pool.
pub struct TimedPool<E: StorageEngine> {
    inner: Arc<TimedPoolInner<E>>,
}

impl<E: StorageEngine> Clone for TimedPool<E> {
    fn clone(&self) -> Self {
        TimedPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct TimedPoolInner<E: StorageEngine> {
    base_dir: Utf8PathBuf,
    period: Period,
    pool: Pool<E>,
}

/// A pooled connection to one bucket's store, tagged with the bucket's
/// series key. Dereferences to the underlying [`Connection`]; release it
/// with [`Connection::close`] like any other pooled connection.
pub struct TimedConnection<E: StorageEngine> {
    pool: Arc<TimedPoolInner<E>>,
    series: String,
    conn: Arc<Connection<E>>,
}

impl<E: StorageEngine> TimedPool<E> {
    /// Create a pool rotating stores under `base_dir` at `period`
    /// granularity. Bucket boundaries are computed in UTC for the lifetime
    /// of the pool. Spawns the eviction task, so this must be called within
    /// a tokio runtime.
    pub fn new(
        base_dir: impl Into<Utf8PathBuf>,
        period: Period,
        engine: E,
        config: PoolConfig,
    ) -> Self {
        TimedPool {
            inner: Arc::new(TimedPoolInner {
                base_dir: base_dir.into(),
                period,
                pool: Pool::new(engine, config),
            }),
        }
    }

    /// Connection for the bucket containing `t`, opening its store on first
    /// use.
    pub fn get_connection(&self, t: DateTime<Utc>) -> Result<TimedConnection<E>, TimedPoolError> {
        TimedPoolInner::connection_for_series(&self.inner, self.inner.period.series(t))
    }

    /// Same get-or-create semantics as [`TimedPool::get_connection`]; the
    /// separate spelling exists for setup flows that read better as "create
    /// the bucket for `t`".
    pub fn new_connection(&self, t: DateTime<Utc>) -> Result<TimedConnection<E>, TimedPoolError> {
        self.get_connection(t)
    }

    /// Connection for the bucket immediately after the one containing `t`.
    pub fn next_connection(&self, t: DateTime<Utc>) -> Result<TimedConnection<E>, TimedPoolError> {
        let series = self.inner.period.next_series(&self.inner.period.series(t))?;
        TimedPoolInner::connection_for_series(&self.inner, series)
    }

    /// Connection for the bucket immediately before the one containing `t`.
    pub fn prev_connection(&self, t: DateTime<Utc>) -> Result<TimedConnection<E>, TimedPoolError> {
        let series = self.inner.period.prev_series(&self.inner.period.series(t))?;
        TimedPoolInner::connection_for_series(&self.inner, series)
    }

    pub fn period(&self) -> Period {
        self.inner.period
    }

    pub fn base_dir(&self) -> &Utf8Path {
        &self.inner.base_dir
    }

    /// The underlying path-keyed pool, for membership checks and
    /// diagnostics.
    pub fn pool(&self) -> &Pool<E> {
        &self.inner.pool
    }

    /// Shut down the underlying pool. Terminal, like [`Pool::close`].
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

impl<E: StorageEngine> TimedPoolInner<E> {
    fn connection_for_series(
        inner: &Arc<Self>,
        series: String,
    ) -> Result<TimedConnection<E>, TimedPoolError> {
        let path = inner.period.bucket_path(&inner.base_dir, &series);
        let conn = inner.pool.get(&path)?;
        Ok(TimedConnection {
            pool: Arc::clone(inner),
            series,
            conn,
        })
    }
}

impl<E: StorageEngine> TimedConnection<E> {
    /// The series key of this connection's bucket.
    pub fn series(&self) -> &str {
        &self.series
    }

    /// Acquire the chronologically next bucket, computed from this
    /// connection's own series. This connection is unaffected; the caller
    /// owns both references and closes each independently.
    pub fn next(&self) -> Result<TimedConnection<E>, TimedPoolError> {
        let series = self.pool.period.next_series(&self.series)?;
        TimedPoolInner::connection_for_series(&self.pool, series)
    }

    /// Acquire the chronologically previous bucket. See
    /// [`TimedConnection::next`].
    pub fn prev(&self) -> Result<TimedConnection<E>, TimedPoolError> {
        let series = self.pool.period.prev_series(&self.series)?;
        TimedPoolInner::connection_for_series(&self.pool, series)
    }
}

impl<E: StorageEngine> std::ops::Deref for TimedConnection<E> {
    type Target = Connection<E>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl<E: StorageEngine> std::fmt::Debug for TimedConnection<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedConnection")
            .field("series", &self.series)
            .field("path", &self.conn.key())
            .finish_non_exhaustive()
    }
}
