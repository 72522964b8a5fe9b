//! Idle staging reaper.
//!
//! Clients that vanish mid-upload leave staging files behind. This background
//! task purges keys whose last chunk is older than the idle TTL.

use crate::{
    models::session::SessionState,
    services::receiver_service::{ReceiverResult, ReceiverService, remove_file_if_exists},
};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run `reap_idle` every `interval` until the task is dropped.
pub async fn run_reaper_loop(service: ReceiverService, interval: Duration, idle_ttl: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; nothing can be idle yet.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match reap_idle(&service, idle_ttl).await {
            Ok(count) => {
                if count > 0 {
                    info!("Reaper: purged {} idle staging sessions", count);
                }
            }
            Err(e) => {
                warn!("Reaper error: {}", e);
            }
        }
    }
}

/// Purge staging keys idle for longer than `idle_ttl`.
///
/// In-progress keys lose their staging file and row. Finalized and aborted
/// rows are dropped too; final artifacts stay on disk. Keys that are locked
/// by an in-flight request are skipped until the next pass.
pub async fn reap_idle(service: &ReceiverService, idle_ttl: Duration) -> ReceiverResult<usize> {
    let ttl = ChronoDuration::from_std(idle_ttl).unwrap_or(ChronoDuration::MAX);
    let cutoff = Utc::now().checked_sub_signed(ttl).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let mut purged = 0;
    for session in service.list_sessions().await? {
        if session.updated_at >= cutoff {
            continue;
        }
        let Some(_guard) = service.locks.try_acquire(&session.staging_key) else {
            debug!(key = %session.staging_key, "skipping busy staging key");
            continue;
        };

        // Re-read under the lock; a chunk may have landed since the listing.
        let Some(current) = service.fetch_session(&session.staging_key).await? else {
            continue;
        };
        if current.updated_at >= cutoff {
            continue;
        }

        if matches!(current.state, SessionState::Pending | SessionState::Accumulating) {
            let staging =
                service.staging_path(&current.staging_key, current.extension.as_deref());
            remove_file_if_exists(&staging).await?;
            debug!(
                key = %current.staging_key,
                file = %current.filename,
                bytes = current.bytes_received,
                "removed idle staging artifact"
            );
        }
        service.delete_session(&current.staging_key).await?;
        purged += 1;
    }

    let pruned = service.locks.prune();
    if pruned > 0 {
        debug!("pruned {} idle key locks", pruned);
    }

    Ok(purged)
}
