//! Bus-reinject writer (§4.7): one task per redis endpoint, draining the
//! scheduler's per-endpoint reinject queue back onto the original list.

use std::time::Duration;

use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::scheduler::SchedulerHandle;

const DRAIN_BATCH: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(
    endpoint: String,
    redis_client: redis::Client,
    scheduler: SchedulerHandle,
    shutdown_phase: watch::Receiver<u8>,
) {
    loop {
        let batch = scheduler.drain_bus_reinject(&endpoint, DRAIN_BATCH).await;
        if batch.is_empty() {
            if *shutdown_phase.borrow() >= 4 {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }

        let conn = redis_client.get_multiplexed_tokio_connection().await;
        let mut conn = match conn {
            Ok(c) => c,
            Err(err) => {
                error!(endpoint = %endpoint, error = %err, "reinject writer can't reach redis, retrying");
                if *shutdown_phase.borrow() >= 4 {
                    warn!(endpoint = %endpoint, count = batch.len(), "shutting down, dropping bus-reinject batch");
                } else {
                    scheduler.requeue_bus_reinject(&endpoint, batch).await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                continue;
            }
        };

        let mut iter = batch.into_iter();
        for exchange in iter.by_ref() {
            let list = &exchange.source.list_name;
            let result: redis::RedisResult<i64> =
                conn.lpush(list, exchange.serialized.clone()).await;
            if let Err(err) = result {
                if *shutdown_phase.borrow() >= 4 {
                    warn!(endpoint = %endpoint, error = %err, "bus reinject lpush failed, shutting down, dropping");
                } else {
                    warn!(endpoint = %endpoint, error = %err, "bus reinject lpush failed, will retry");
                    let mut remainder = vec![exchange];
                    remainder.extend(iter);
                    scheduler.requeue_bus_reinject(&endpoint, remainder).await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                break;
            }
        }
    }
}
