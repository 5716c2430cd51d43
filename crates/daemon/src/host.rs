use taskvault_rollback::HostSignals;
use tracing::info;

/// Host-signal sink for the standalone daemon. The host application tails
/// the daemon's log stream, so the fire-and-forget signals surface as
/// structured log records.
pub struct LoggingHostSignals;

impl HostSignals for LoggingHostSignals {
    fn pause_writes(&self) {
        info!(signal = "pause_writes", "broadcasting host signal");
    }

    fn clear_caches(&self) {
        info!(signal = "clear_caches", "broadcasting host signal");
    }

    fn request_restart(&self) {
        info!(signal = "request_restart", "broadcasting host signal");
    }
}
