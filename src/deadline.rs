//! Deadline and cancellation guard for collaborator calls
//!
//! Every call that leaves the process (geocoder, reputation service,
//! GeoIP, stores) is raced against the caller's cancellation token and a
//! per-call timeout so that a stuck collaborator cannot pin a detection
//! run forever.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{DetectionError, LookupError};

/// Why a guarded future did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Cancelled,
    TimedOut,
}

impl From<Interrupted> for LookupError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::Cancelled => LookupError::Cancelled,
            Interrupted::TimedOut => LookupError::TimedOut,
        }
    }
}

impl From<Interrupted> for DetectionError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::Cancelled => DetectionError::Cancelled,
            Interrupted::TimedOut => DetectionError::TimedOut,
        }
    }
}

/// Run `fut` until it completes, the token fires or `timeout` elapses
///
/// Cancellation wins over completion when both are ready at once.
pub async fn guarded<F>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| Interrupted::TimedOut),
    }
}

/// Guard a fallible lookup, folding interruption into [`LookupError`]
pub async fn guarded_lookup<F, T>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> Result<T, LookupError>
where
    F: Future<Output = Result<T, LookupError>>,
{
    guarded(cancel, timeout, fut).await?
}
