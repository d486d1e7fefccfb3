//! Single-retry wrapper for persistence writes.

use std::future::Future;

use pulse_state::{StorageError, StorageResult};
use tracing::warn;

/// Run `op`, retrying once on a retryable failure.
///
/// `ImmutableRecord` and `NotFound` are returned immediately: repeating the
/// same write cannot succeed.
pub async fn retry_once<T, F, Fut>(what: &str, mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err @ (StorageError::ImmutableRecord { .. } | StorageError::NotFound { .. })) => {
            Err(err)
        }
        Err(first) => {
            warn!(what, error = %first, "write failed; retrying once");
            op().await
        }
    }
}
