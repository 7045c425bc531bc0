//! One Redis client pool per endpoint, lazily created (§5). Generalizes the
//! retry-connect-with-backoff shape of a single shared connection to a
//! per-host map of shared multiplexed connections.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Default)]
pub struct RedisPool {
    conns: Mutex<HashMap<String, redis::aio::MultiplexedConnection>>,
}

fn endpoint_key(host: &str, port: u16, uds: Option<&str>) -> String {
    match uds {
        Some(path) => path.to_string(),
        None => format!("{host}:{port}"),
    }
}

fn endpoint_url(host: &str, port: u16, uds: Option<&str>) -> String {
    match uds {
        Some(path) => format!("redis+unix://{path}"),
        None => format!("redis://{host}:{port}"),
    }
}

impl RedisPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the shared multiplexed connection for this
    /// endpoint, connecting (with backoff, mirroring the retry loop every
    /// long-running service in this pack uses on startup) on first use.
    pub async fn connection(
        &self,
        host: &str,
        port: u16,
        uds: Option<&str>,
    ) -> Result<redis::aio::MultiplexedConnection> {
        let key = endpoint_key(host, port, uds);
        if let Some(conn) = self.conns.lock().await.get(&key) {
            return Ok(conn.clone());
        }

        // Dial outside the lock: one slow/unreachable endpoint must not
        // block every other endpoint's lookup for the length of the retry
        // loop below.
        let url = endpoint_url(host, port, uds);
        let client = redis::Client::open(url.clone())
            .with_context(|| format!("invalid redis url {url}"))?;

        let mut attempt: u32 = 0;
        let conn = loop {
            attempt += 1;
            match client.get_multiplexed_tokio_connection().await {
                Ok(c) => break c,
                Err(err) if attempt < 30 => {
                    warn!(endpoint = %key, attempt, error = %err, "redis connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(err) => return Err(err).with_context(|| format!("connecting to redis {key}")),
            }
        };

        let mut guard = self.conns.lock().await;
        // Another caller may have raced us and already connected; keep
        // whichever connection is already shared so callers converge.
        Ok(guard.entry(key).or_insert(conn).clone())
    }
}
