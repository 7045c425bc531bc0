//! Expiration sweeper (§4.7): every 100ms, ask the scheduler to drop
//! over-lifetime blocked exchanges and bus-reinject over-local-queue-age
//! ones.

use std::time::Duration;

use tokio::sync::watch;

use crate::scheduler::SchedulerHandle;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

pub async fn run(scheduler: SchedulerHandle, shutdown_phase: watch::Receiver<u8>) {
    loop {
        if *shutdown_phase.borrow() >= 2 {
            break;
        }
        scheduler.sweep().await;
        tokio::time::sleep(SWEEP_INTERVAL).await;
    }
}
