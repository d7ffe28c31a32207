//! Bounded retries for best-effort collaborator writes.

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Run `op` up to `attempts` times, sleeping `pause` between tries.
///
/// Returns the last error once the budget is spent.
pub(crate) async fn with_retries<F, Fut>(
    attempts: u32,
    pause: Duration,
    what: &'static str,
    mut op: F,
) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                tracing::debug!(error = %e, attempt, what, "Write failed, retrying");
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
