//! Long-running background task that closes overdue enrollments.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use commit_engine::ChallengeEngine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Run `sweep_overdue` every `interval` until `shutdown` is cancelled.
pub async fn run(engine: Arc<ChallengeEngine>, interval: Duration, shutdown: CancellationToken) {
    info!("Overdue sweep starting (every {}s)", interval.as_secs());

    loop {
        match engine.sweep_overdue(Utc::now()).await {
            Ok(closed) if closed.is_empty() => debug!("Sweep found nothing overdue"),
            Ok(closed) => info!("Sweep failed {} enrollments: {closed:?}", closed.len()),
            Err(e) => error!("Sweep error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Overdue sweep stopped");
}
