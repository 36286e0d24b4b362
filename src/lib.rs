//! Reference-counted pooling of embedded key-value store handles, with a
//! time-bucketed rotation layer on top.
//!
//! Opening the same store file from many places is expensive and, for
//! single-writer embedded engines, not even allowed. [`Pool`] multiplexes
//! concurrent requests for the same path onto one physical handle and tracks
//! how many callers hold it; the handle is closed when the last holder
//! releases it, either immediately or after a configurable grace window that
//! absorbs bursty reacquisition. [`TimedPool`] keys stores by calendar bucket
//! (hour, day, month or year) instead of by explicit path, rotating to a new
//! file as time advances and letting callers walk to adjacent buckets.
//!
//! Handles must be released through [`Connection::close`], never by closing
//! the underlying store directly.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use chrono::Utc;
//! use store_pool::{Period, PoolConfig, RedbEngine, TimedPool};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = TimedPool::new(
//!         "/var/lib/app/events",
//!         Period::Daily,
//!         RedbEngine::new(),
//!         PoolConfig {
//!             expires: Duration::from_secs(5),
//!             ..PoolConfig::default()
//!         },
//!     );
//!
//!     let conn = pool.get_connection(Utc::now())?;
//!     {
//!         let db = conn.store().database()?;
//!         // run transactions against `db`
//!     }
//!     // yesterday's bucket, without touching the clock again
//!     let prev = conn.prev()?;
//!     prev.close();
//!     conn.close();
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
#![deny(unsafe_code)]

pub mod config;
pub mod period;
pub mod pool;
pub mod store;
pub mod timed;

pub use config::{ErrorHandler, PoolConfig, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
pub use period::{Period, PeriodError, STORE_FILE_SUFFIX};
pub use pool::{Connection, Pool, PoolError};
pub use store::{RedbEngine, RedbHandle, StorageEngine, StoreHandle};
pub use timed::{TimedConnection, TimedPool, TimedPoolError};
