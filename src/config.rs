//! Pool configuration.

use std::time::Duration;

use crate::pool::PoolError;

/// Permission bits for newly created store files when [`PoolConfig::file_mode`]
/// is left at zero.
pub const DEFAULT_FILE_MODE: u32 = 0o666;

/// Permission bits for newly created store directories when
/// [`PoolConfig::dir_mode`] is left at zero.
pub const DEFAULT_DIR_MODE: u32 = 0o777;

/// Callback receiving errors that surface on background paths (eviction
/// sweeps, forced shutdown) where no caller is around to return them to.
///
/// Each such error is delivered exactly once: either returned to a caller or
/// passed here, never both.
pub type ErrorHandler = Box<dyn Fn(PoolError) + Send + Sync + 'static>;

/// Options for constructing a [`Pool`](crate::Pool).
pub struct PoolConfig {
    /// Permission bits applied to store files created by the engine.
    /// Zero means [`DEFAULT_FILE_MODE`].
    pub file_mode: u32,

    /// Permission bits for directories the pool creates for store files.
    /// Zero means [`DEFAULT_DIR_MODE`].
    pub dir_mode: u32,

    /// How long an idle handle stays open after its reference count drops to
    /// zero, absorbing reacquire churn. Zero closes the handle immediately,
    /// with no caching of idle handles.
    pub expires: Duration,

    /// Receives errors from asynchronous close paths. `None` falls back to
    /// logging through `tracing::error!`.
    pub error_handler: Option<ErrorHandler>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            file_mode: 0,
            dir_mode: 0,
            expires: Duration::ZERO,
            error_handler: None,
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("file_mode", &format_args!("{:#o}", self.file_mode))
            .field("dir_mode", &format_args!("{:#o}", self.dir_mode))
            .field("expires", &self.expires)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

pub(crate) fn default_error_handler() -> ErrorHandler {
    Box::new(|err| tracing::error!(error = %err, "store pool background error"))
}
