//! Shared handling for listener accept errors.

use std::io;
use std::time::Duration;

use tracing::warn;

/// Pause after a failed `accept` before trying again. Errors such as
/// `EMFILE` persist until a descriptor is freed, so retrying at once would
/// spin.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Log a failed accept and wait out [`ACCEPT_ERROR_BACKOFF`].
pub async fn back_off_after_accept_error(error: &io::Error) {
    warn!(error = %error, "accept failed, backing off");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}
