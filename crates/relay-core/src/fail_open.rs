//! Fail-open utilities for graceful degradation
//!
//! Work that only improves answer quality (retrieval context, telemetry)
//! must never abort a dispatch. Wrap it here and carry on with `None`.
//!
//! DO NOT use fail-open for:
//! - Risk tier checks (fail closed)
//! - Agent calls (classified and retried instead)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an operation that degrades to `None` on failure
///
/// The failure is logged at warn level as a degraded-quality event.
///
/// ```no_run
/// use relay_core::fail_open::fail_open;
/// use relay_core::Result;
///
/// async fn fetch_context() -> Result<Vec<String>> {
///     Ok(vec![])
/// }
///
/// async fn example() {
///     let context = fail_open("retrieval", || fetch_context()).await;
///     // context is None if fetch_context() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(
                operation = operation_name,
                error = %e,
                "{} failed, continuing with degraded quality",
                operation_name
            );
            None
        }
    }
}
