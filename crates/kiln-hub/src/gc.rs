//! Retention GC task shared by topics and queues.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kiln_core::event::now_ms;

use crate::bus::MessageBus;

pub(crate) type SharedBus = Arc<Mutex<Box<dyn MessageBus + Send>>>;

/// Spawns the periodic purge task for one channel.
///
/// The task holds only the shared bus handle, so a dropped channel does not
/// keep itself alive through its own GC; cancellation happens explicitly on
/// `stop()` through the returned token. Panics inside a purge pass are
/// logged and swallowed so GC can never take the channel down.
pub(crate) fn spawn_retention_gc(
    channel: String,
    bus: SharedBus,
    retention_ms: u64,
    interval_ms: u64,
) -> CancellationToken {
    let token = CancellationToken::new();
    let task_token = token.clone();

    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately; consume the first tick so the initial
        // purge happens one full interval after start.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    let pass = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        bus.lock().purge_expired(now_ms(), retention_ms)
                    }));
                    match pass {
                        Ok(purged) if purged > 0 => {
                            debug!(channel = %channel, purged, "Retention GC purged expired messages");
                        }
                        Ok(_) => {}
                        Err(_) => {
                            warn!(channel = %channel, "Retention GC pass panicked; continuing");
                        }
                    }
                }
            }
        }
        debug!(channel = %channel, "Retention GC stopped");
    });

    token
}
