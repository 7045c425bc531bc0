//! §4.7 "Process" / "Process callback": issue the upstream HTTP call with
//! manual redirect handling, publish the response onto the reply list, and
//! tell the scheduler which counters to release.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use reqwest::redirect::Policy;
use serde_json::Map;
use thr_core::codec;
use thr_core::request_exchange::HttpRequestExchange;
use tracing::{error, warn};

use crate::scheduler::{AdmitOutcome, SchedulerHandle};

const MAX_REDIRECTS: u32 = 10;
const REDIRECTABLE_STATUSES: [u16; 4] = [301, 302, 307, 308];

pub struct ProcessConfig {
    pub upstream_timeout: Duration,
    pub add_thr_extra_headers: bool,
}

/// Builds the upstream `reqwest::Client`. `Policy::none()` makes redirects
/// explicit: spec §4.7 wants the dispatcher itself to cap and relabel them,
/// not the HTTP client.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent("thr-dispatcher/0.1")
        .redirect(Policy::none())
        .build()
        .expect("failed to build upstream reqwest client")
}

/// Builds a client pinned to a Unix domain socket upstream (§3/§5 "upstream
/// http port or unix socket"). DNS resolution on the request URL's host is
/// skipped entirely; only the path/scheme matter.
pub fn build_unix_socket_client(path: &str) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent("thr-dispatcher/0.1")
        .redirect(Policy::none())
        .unix_socket(std::path::PathBuf::from(path))
        .build()
        .expect("failed to build unix-socket upstream reqwest client")
}

/// Runs one admitted exchange to completion: upstream call (following
/// redirects manually, capped at [`MAX_REDIRECTS`]), response publish, and
/// the scheduler notification that releases its counters.
pub async fn process_request(
    client: reqwest::Client,
    redis_client: redis::Client,
    scheduler: SchedulerHandle,
    exchange: Arc<HttpRequestExchange>,
    counters: Vec<String>,
    config: Arc<ProcessConfig>,
) {
    let result = run_upstream(&client, &exchange, &config).await;
    let reply_ttl_secs = config.upstream_timeout.as_secs().max(1);
    let wire_response = match result {
        Ok((status, headers, body)) => {
            codec::serialize_response(status, headers, Some(&body), None, Map::new())
        }
        Err(err) => {
            warn!(request_id = exchange.request_id(), error = %err, "upstream call failed");
            // §7 "Upstream timeout or 599": the frontend rewrites 599 to 504.
            codec::serialize_response(
                599,
                vec![("Content-Type".to_string(), "text/plain".to_string())],
                Some(err.to_string().as_bytes()),
                None,
                Map::new(),
            )
        }
    };

    if let Some(response_key) = exchange.response_key()
        && let Err(err) =
            publish_response(&redis_client, &response_key, &wire_response, reply_ttl_secs).await
    {
        error!(request_id = exchange.request_id(), error = %err, "failed to publish response");
    }

    scheduler
        .complete(exchange.request_id().to_string(), counters)
        .await;
}

async fn publish_response(
    redis_client: &redis::Client,
    response_key: &str,
    wire_response: &str,
    ttl_secs: u64,
) -> redis::RedisResult<()> {
    let mut conn = redis_client.get_multiplexed_tokio_connection().await?;
    redis::pipe()
        .atomic()
        .lpush(response_key, wire_response)
        .expire(response_key, ttl_secs as i64)
        .query_async::<()>(&mut conn)
        .await
}

pub(crate) async fn run_upstream(
    client: &reqwest::Client,
    exchange: &HttpRequestExchange,
    config: &ProcessConfig,
) -> Result<(u16, Vec<(String, String)>, Vec<u8>), anyhow::Error> {
    let request = exchange.request();
    let method = request.method.clone();
    let mut url = if exchange.source.upstream_unix_socket.is_some() {
        // Host/port are ignored once the client is pinned to a unix socket.
        format!("http://localhost{}", request.path)
    } else {
        format!(
            "http://{}:{}{}",
            exchange.source.upstream_host, exchange.source.upstream_port, request.path
        )
    };

    for _ in 0..=MAX_REDIRECTS {
        let mut builder = client.request(
            reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET),
            &url,
        );
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if config.add_thr_extra_headers {
            builder = builder.header("X-Thr-Bus", "1");
        }
        if !request.query_arguments.is_empty() {
            let pairs: Vec<(String, String)> = request
                .query_arguments
                .iter()
                .flat_map(|(k, values)| values.iter().map(move |v| (k.clone(), v.clone())))
                .collect();
            builder = builder.query(&pairs);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder = builder.timeout(config.upstream_timeout);

        let response = builder.send().await?;
        let status = response.status().as_u16();

        let follow = REDIRECTABLE_STATUSES.contains(&status)
            && response
                .headers()
                .get("x-thr-followredirects")
                .and_then(|v| v.to_str().ok())
                == Some("1");
        if follow
            && let Some(location) = response.headers().get("location")
        {
            url = location.to_str().unwrap_or_default().to_string();
            continue;
        }

        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response.bytes().await?.to_vec();
        return Ok((status, headers, body));
    }

    // Redirected past the cap without terminating: surface it distinctly
    // rather than follow forever.
    Ok((310, Vec::new(), Vec::new()))
}

/// Drives one puller: multi-key BRPOP loop against every list in the
/// queue's descriptor (§4.7 "one per queue descriptor × worker count ...
/// `BRPOP q1 q2 ... qN timeout=5s`"), admitting each message and, on
/// success, spawning the upstream call.
pub async fn puller_loop(
    mut conn: redis::aio::MultiplexedConnection,
    queue: Arc<crate::queue::QueueDescriptor>,
    list_names: Vec<String>,
    scheduler: SchedulerHandle,
    client: reqwest::Client,
    redis_client: redis::Client,
    process_config: Arc<ProcessConfig>,
    shutdown: tokio::sync::watch::Receiver<u8>,
) {
    loop {
        if *shutdown.borrow() >= 1 {
            break;
        }
        let popped: redis::RedisResult<Option<(String, String)>> = conn
            .brpop(list_names.clone(), thr_core::BRPOP_TIMEOUT_SECS as f64)
            .await;
        let (list_name, payload) = match popped {
            Ok(Some(pair)) => pair,
            Ok(None) => continue,
            Err(err) => {
                error!(error = %err, "brpop failed, backing off");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let source = queue.source_queue(&list_name);
        let exchange = Arc::new(HttpRequestExchange::new(payload, source));
        if exchange.is_malformed() {
            warn!(request = %exchange.serialized, "dropping malformed request envelope");
            continue;
        }

        match scheduler.admit(exchange.clone()).await {
            AdmitOutcome::Admitted { names } => {
                tokio::spawn(process_request(
                    client.clone(),
                    redis_client.clone(),
                    scheduler.clone(),
                    exchange,
                    names,
                    process_config.clone(),
                ));
            }
            AdmitOutcome::Queued { .. }
            | AdmitOutcome::BusReinjected
            | AdmitOutcome::ShuttingDown => {}
            AdmitOutcome::Expired => {
                warn!(request_id = exchange.request_id(), "dropped expired request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use indexmap::IndexMap;
    use thr_core::request_exchange::SourceQueue;

    async fn always_redirect(
        axum::extract::State(addr): axum::extract::State<std::net::SocketAddr>,
    ) -> impl IntoResponse {
        (
            axum::http::StatusCode::FOUND,
            [
                ("Location".to_string(), format!("http://{addr}/next")),
                ("X-Thr-FollowRedirects".to_string(), "1".to_string()),
            ],
        )
    }

    #[tokio::test]
    async fn redirect_loop_synthesizes_310_after_cap() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route("/next", get(always_redirect))
            .with_state(addr);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let source = SourceQueue {
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_unix_socket: None,
            list_name: "q".to_string(),
            upstream_host: addr.ip().to_string(),
            upstream_port: addr.port(),
            upstream_unix_socket: None,
        };
        let wire = codec::serialize_request(
            "GET", "/next", "h", "1.1.1.1", IndexMap::new(), vec![], None, None, None,
            serde_json::Map::new(),
        );
        let exchange = HttpRequestExchange::new(wire, source);
        let client = build_client();
        let config = ProcessConfig {
            upstream_timeout: Duration::from_secs(5),
            add_thr_extra_headers: false,
        };

        let (status, _headers, _body) = run_upstream(&client, &exchange, &config).await.unwrap();
        assert_eq!(status, 310);
    }
}
