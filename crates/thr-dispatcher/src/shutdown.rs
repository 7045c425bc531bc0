//! Shutdown state machine (§4.7): phases `0..5`, driven by `SIGTERM` and
//! task-completion polling.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::scheduler::SchedulerHandle;

pub async fn run(
    phase_tx: watch::Sender<u8>,
    scheduler: SchedulerHandle,
    puller_handles: Vec<JoinHandle<()>>,
) {
    wait_for_sigterm().await;
    info!("SIGTERM received, entering shutdown phase 1 (stop pullers)");
    let _ = phase_tx.send(1);

    info!(count = puller_handles.len(), "awaiting puller tasks to exit");
    futures::future::join_all(puller_handles).await;
    info!("shutdown phase 2 (stop expiration sweeper)");
    let _ = phase_tx.send(2);

    info!("shutdown phase 3 (draining running exchanges)");
    let _ = phase_tx.send(3);
    loop {
        let running = scheduler.running_count().await;
        if running == 0 {
            break;
        }
        info!(running, "waiting for in-flight requests to finish");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    info!("shutdown phase 4 (flushing queues, stopping bus-reinject writers)");
    let _ = phase_tx.send(4);
    scheduler.flush_to_bus().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("shutdown phase 5 (stopping event loop)");
    let _ = phase_tx.send(5);
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    let _ = tokio::signal::ctrl_c().await;
}
