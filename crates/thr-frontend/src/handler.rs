//! §4.6: a single handler terminating all methods on all paths.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use indexmap::IndexMap;
use redis::AsyncCommands;
use serde_json::{json, Map};
use thr_core::codec::{self, ProxyIp};
use thr_core::exchange::{ExchangeRequest, HttpExchange};
use tracing::{error, warn};

use crate::state::AppState;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn fallback(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("failed to read body: {err}"))
                .into_response();
        }
    };

    let mut exchange = build_exchange(&state, &parts, addr, body_bytes);
    let matched = state.rules.execute_input(&mut exchange).await;

    if exchange.response.status_code.is_some() {
        state.rules.execute_output(&mut exchange, &matched).await;
        return reply(exchange);
    }

    if exchange.redis.queue == "null" {
        exchange.response.status_code = Some(404);
        exchange.response.body = Some(b"no redis queue set".to_vec());
        state.rules.execute_output(&mut exchange, &matched).await;
        return reply(exchange);
    }

    match dispatch_over_bus(&state, &mut exchange).await {
        Ok(()) => {}
        Err((status, message)) => {
            exchange.response.status_code = Some(status);
            exchange.response.body = Some(message.into_bytes());
        }
    }
    state.rules.execute_output(&mut exchange, &matched).await;
    reply(exchange)
}

fn build_exchange(
    state: &AppState,
    parts: &axum::http::request::Parts,
    addr: SocketAddr,
    body: Bytes,
) -> HttpExchange {
    let host = parts
        .headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut query_arguments: IndexMap<String, Vec<String>> = IndexMap::new();
    if let Some(query) = parts.uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            query_arguments
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }

    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let request = ExchangeRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        host,
        remote_ip: addr.ip().to_string(),
        query_arguments,
        headers,
        body: body.to_vec(),
    };

    HttpExchange::new(
        request,
        state.default_redis_host.clone(),
        state.default_redis_port,
        state.default_redis_queue.clone(),
        state.default_redis_uds.clone(),
    )
}

/// §4.6's bus round trip: allocate a response key, `LPUSH` the serialized
/// request, and `BRPOP` the reply within the configured timeout budget.
async fn dispatch_over_bus(state: &AppState, exchange: &mut HttpExchange) -> Result<(), (u16, String)> {
    let response_key = format!("thr:queue:response:{}", uuid::Uuid::new_v4().simple());
    let creation_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut extra = Map::new();
    extra.insert("response_key".to_string(), json!(response_key));
    extra.insert("priority".to_string(), json!(exchange.priority));
    extra.insert("creation_time".to_string(), json!(creation_time));
    extra.insert("request_id".to_string(), json!(exchange.request_id));

    let wire = codec::serialize_request(
        &exchange.request.method,
        &exchange.request.path,
        &exchange.request.host,
        &exchange.request.remote_ip,
        exchange.request.query_arguments.clone(),
        exchange.request.headers.clone(),
        Some(&exchange.request.body),
        None,
        Some(ProxyIp::Auto(exchange.request.remote_ip.clone())),
        extra,
    );

    let mut conn = state
        .redis
        .connection(
            &exchange.redis.host,
            exchange.redis.port,
            exchange.redis.unix_socket.as_deref(),
        )
        .await
        .map_err(|_| (500u16, "can't connect to bus".to_string()))?;

    let push_result: redis::RedisResult<i64> = conn.lpush(&exchange.redis.queue, &wire).await;
    if push_result.is_err() {
        return Err((500, "can't connect to bus".to_string()));
    }

    let deadline = tokio::time::Instant::now() + state.timeout;
    let reply = loop {
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
        let popped: redis::RedisResult<Option<(String, String)>> =
            conn.brpop(response_key.clone(), 1.0).await;
        match popped {
            Ok(Some((_, payload))) => break Some(payload),
            Ok(None) => continue,
            Err(err) => {
                error!(error = %err, "brpop against response key failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        }
    };

    let Some(payload) = reply else {
        return Err((504, "no reply from the backend".to_string()));
    };

    let decoded = codec::unserialize_response(&payload)
        .map_err(|_| (502u16, "malformed response from backend".to_string()))?;

    let status = if decoded.status_code == 599 {
        504
    } else {
        decoded.status_code
    };
    exchange.response.status_code = Some(status);
    exchange.response.headers = decoded.headers;
    exchange.response.body = decoded.body.or(exchange.output_default_body.clone());
    Ok(())
}

fn reply(exchange: HttpExchange) -> Response {
    let status = exchange.response.status_code.unwrap_or(500);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &exchange.response.headers {
        builder = builder.header(name, value);
    }
    let body = exchange
        .response
        .body
        .or(exchange.output_default_body)
        .unwrap_or_default();
    match builder.body(Body::from(body)) {
        Ok(resp) => resp,
        Err(err) => {
            warn!(error = %err, "failed to build response, falling back to 500");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_pool::RedisPool;
    use std::sync::Arc;
    use thr_core::exchange::{ExchangeRequest, RedisTarget};
    use thr_core::rules::RuleSet;

    fn test_exchange(queue: &str) -> HttpExchange {
        let request = ExchangeRequest {
            method: "GET".to_string(),
            path: "/quux".to_string(),
            host: "example.com".to_string(),
            remote_ip: "127.0.0.1".to_string(),
            query_arguments: IndexMap::new(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        HttpExchange {
            request,
            response: Default::default(),
            priority: 50,
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            redis: RedisTarget {
                host: "127.0.0.1".to_string(),
                port: 6379,
                unix_socket: None,
                queue: queue.to_string(),
            },
            output_default_body: None,
            matched_rules: None,
            keyvalues: Map::new(),
        }
    }

    fn test_state() -> AppState {
        AppState {
            rules: Arc::new(RuleSet::new()),
            redis: Arc::new(RedisPool::new()),
            default_redis_host: "127.0.0.1".to_string(),
            default_redis_port: 6379,
            default_redis_uds: None,
            default_redis_queue: "thr:queue:default".to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    /// Property 7: a worker answering on the allocated response key is read
    /// back verbatim.
    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn end_to_end_happy_path_reads_worker_response() {
        let state = test_state();
        let mut exchange = test_exchange("test-queue");

        let client = redis::Client::open("redis://127.0.0.1:6379/").unwrap();
        let mut conn = client.get_multiplexed_tokio_connection().await.unwrap();
        let _: () = redis::cmd("DEL").arg("test-queue").query_async(&mut conn).await.unwrap();

        let worker = tokio::spawn({
            let mut conn = conn.clone();
            async move {
                let popped: (String, String) = loop {
                    let res: Option<(String, String)> = redis::AsyncCommands::brpop(
                        &mut conn,
                        "test-queue",
                        5.0,
                    )
                    .await
                    .unwrap();
                    if let Some(pair) = res {
                        break pair;
                    }
                };
                let (_, payload) = popped;
                let request = codec::unserialize_request(&payload, "dispatcher").unwrap();
                let response_key = request
                    .extra
                    .get("response_key")
                    .and_then(|v| v.as_str())
                    .unwrap()
                    .to_string();
                let wire = codec::serialize_response(
                    200,
                    vec![],
                    Some(b"bar"),
                    None,
                    Map::new(),
                );
                let _: () = redis::AsyncCommands::lpush(&mut conn, &response_key, wire)
                    .await
                    .unwrap();
            }
        });

        dispatch_over_bus(&state, &mut exchange).await.unwrap();
        worker.await.unwrap();

        assert_eq!(exchange.response.status_code, Some(200));
        assert_eq!(exchange.response.body, Some(b"bar".to_vec()));
    }

    /// Property 8: no worker listening within the timeout budget surfaces a
    /// 504 with the fixed body, not an error status from redis itself.
    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn timeout_surfaces_504() {
        let mut state = test_state();
        state.timeout = Duration::from_secs(1);
        let mut exchange = test_exchange("nobody-is-listening-queue");

        let result = dispatch_over_bus(&state, &mut exchange).await;
        assert_eq!(result, Err((504, "no reply from the backend".to_string())));
    }
}
