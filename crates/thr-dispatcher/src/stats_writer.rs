//! Stats writer (§4.7): every `stats_frequency_ms`, write a JSON snapshot of
//! the scheduler's counters to `stats_file`. `stats_frequency_ms == 0`
//! disables it.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::scheduler::SchedulerHandle;

pub async fn run(
    scheduler: SchedulerHandle,
    stats_file: PathBuf,
    frequency_ms: u64,
    _shutdown_phase: watch::Receiver<u8>,
) {
    if frequency_ms == 0 {
        return;
    }
    let interval = Duration::from_millis(frequency_ms);
    loop {
        let snapshot = scheduler.stats(unix_epoch_secs()).await;
        if let Err(err) = tokio::fs::write(
            &stats_file,
            serde_json::to_vec_pretty(&snapshot).unwrap_or_default(),
        )
        .await
        {
            warn!(path = %stats_file.display(), error = %err, "failed to write stats snapshot");
        }
        tokio::time::sleep(interval).await;
    }
}

fn unix_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
