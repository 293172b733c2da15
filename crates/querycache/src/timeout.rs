use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::FetchError;

/// The deadline of a fetch if none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Races `operation` against a `deadline`.
///
/// If the operation settles first, its outcome is returned unchanged. Otherwise `signal` is
/// cancelled, the operation is dropped, and a [`FetchError::Timeout`] is returned.
pub async fn with_timeout<F, T>(
    deadline: Duration,
    signal: &CancellationToken,
    operation: F,
) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => {
            signal.cancel();
            Err(FetchError::Timeout(deadline))
        }
    }
}
