//! Logging wrapper for side effects whose failure must not fail the caller.

use std::fmt::Display;
use std::future::Future;

use tracing::warn;

/// Await `fut`, log a failure as a warning and swallow it.
///
/// Returns the value on success so callers can still use it.
pub async fn best_effort<T, E, F>(what: &str, upload_id: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(upload_id = %upload_id, "{} failed: {}", what, e);
            None
        }
    }
}
