use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use banter_db::Database;

/// Background task that prunes the signal logs of finished calls.
///
/// Runs on an interval and deletes `call_signals` rows whose call ended
/// more than `grace_secs` ago. The grace window lets a participant that
/// reconnects right after a hangup still observe the terminal envelope.
pub async fn run_signal_prune_loop(db: Arc<Database>, grace_secs: i64, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let db_prune = db.clone();
        match tokio::task::spawn_blocking(move || db_prune.prune_ended_call_signals(grace_secs))
            .await
        {
            Ok(Ok(count)) => {
                if count > 0 {
                    info!("Cleanup: pruned {} signals from ended calls", count);
                }
            }
            Ok(Err(e)) => {
                warn!("Cleanup error: {}", e);
            }
            Err(e) => {
                warn!("Cleanup task failed: {}", e);
            }
        }
    }
}
