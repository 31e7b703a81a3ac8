use std::time::Duration;

use thiserror::Error;

/// Fallback reset delay for a 429 response. `octocrab::Error::GitHub` only
/// carries the decoded JSON error body (message/documentation_url/errors),
/// not the response headers, so `X-RateLimit-Reset`/`Retry-After` aren't
/// recoverable from it - every 429 classification site shares this one
/// constant rather than each guessing its own number.
pub const DEFAULT_RATE_LIMIT_RESET: Duration = Duration::from_secs(60);

/// The error taxonomy for the sync engine.
///
/// Every variant carries a name matching the recovery policy it gets: `should_retry`
/// and `is_fatal` are what the executor and orchestrator actually branch on, the
/// variant itself is mostly for logging and for tests that want to assert on a
/// specific failure mode.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited, resets in {reset_after:?}")]
    RateLimited { reset_after: Duration },

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("local git operation failed: {0}")]
    GitLocal(String),

    #[error("PR already exists: {0}")]
    PrConflict(String),

    #[error("run was cancelled")]
    Cancelled,

    #[error("target executor panicked: {0}")]
    Panicked(String),
}

impl SyncError {
    /// Whether the executor should transparently retry the operation that produced this.
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. } | SyncError::TransientNetwork(_)
        )
    }

    /// Whether this error must abort the whole run rather than just the current target.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::ConfigInvalid(_) | SyncError::AuthFailed(_))
    }
}

impl From<octocrab::Error> for SyncError {
    fn from(err: octocrab::Error) -> Self {
        use octocrab::Error as E;
        match &err {
            E::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                match status {
                    401 | 403 => SyncError::AuthFailed(source.message.clone()),
                    404 => SyncError::NotFound(source.message.clone()),
                    429 => SyncError::RateLimited {
                        reset_after: DEFAULT_RATE_LIMIT_RESET,
                    },
                    _ => SyncError::TransientNetwork(source.message.clone()),
                }
            }
            E::Http { .. } | E::Hyper(_) | E::Service { .. } => {
                SyncError::TransientNetwork(err.to_string())
            }
            other => SyncError::TransientNetwork(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::GitLocal(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::ConfigInvalid(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
