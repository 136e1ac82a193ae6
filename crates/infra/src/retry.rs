//! Bounded retry of units of work that lost an optimistic race.

use crate::error::LedgerError;

/// Run `attempt` until it succeeds, fails with a non-retryable error, or has
/// been retried `max_retries` times after conflicts.
pub fn with_retries<T>(
    operation: &'static str,
    max_retries: u32,
    mut attempt: impl FnMut() -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    let mut retries = 0;
    loop {
        match attempt() {
            Err(err) if err.is_retryable() && retries < max_retries => {
                retries += 1;
                tracing::debug!(operation, retries, error = %err, "retrying after conflict");
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(operation, retries, error = %err, "giving up after conflicts");
                return Err(err);
            }
            other => return other,
        }
    }
}
