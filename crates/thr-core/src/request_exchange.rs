//! `HttpRequestExchange`: the dispatcher's per-request value wrapping the
//! serialized bytes, the source queue, and lazily-deserialized fields (§3).

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::codec::{self, UnserializedRequest};
use crate::limits::RequestView;

/// Where a message was pulled from: enough to reinject it and to force the
/// right upstream `Host`.
#[derive(Debug, Clone)]
pub struct SourceQueue {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_unix_socket: Option<String>,
    /// The specific list this message was BRPOP'd from (for reinjection).
    pub list_name: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_unix_socket: Option<String>,
}

impl SourceQueue {
    pub fn redis_endpoint_key(&self) -> String {
        match &self.redis_unix_socket {
            Some(uds) => uds.clone(),
            None => format!("{}:{}", self.redis_host, self.redis_port),
        }
    }

    fn force_host(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }
}

pub struct HttpRequestExchange {
    pub serialized: String,
    pub source: SourceQueue,
    pub local_queue_time: Instant,
    local_queue_epoch_ms: i64,
    parsed: OnceLock<UnserializedRequest>,
    request_id: OnceLock<String>,
    priority: OnceLock<i64>,
    conditions: OnceLock<Vec<(String, u32)>>,
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl HttpRequestExchange {
    pub fn new(serialized: String, source: SourceQueue) -> Self {
        Self {
            serialized,
            source,
            local_queue_time: Instant::now(),
            local_queue_epoch_ms: now_epoch_ms(),
            parsed: OnceLock::new(),
            request_id: OnceLock::new(),
            priority: OnceLock::new(),
            conditions: OnceLock::new(),
        }
    }

    /// Computes `compute` once and memoizes it on the exchange, so the
    /// puller doesn't re-evaluate limit hashes on every admit retry.
    pub fn conditions_or_init(
        &self,
        compute: impl FnOnce() -> Vec<(String, u32)>,
    ) -> &[(String, u32)] {
        self.conditions.get_or_init(compute)
    }

    fn parsed(&self) -> &UnserializedRequest {
        self.parsed.get_or_init(|| {
            codec::unserialize_request(&self.serialized, &self.source.force_host())
                .unwrap_or_else(|_| UnserializedRequest {
                    method: "GET".to_string(),
                    path: "/".to_string(),
                    query_arguments: Default::default(),
                    headers: Vec::new(),
                    body: None,
                    body_link: None,
                    extra: Map::new(),
                })
        })
    }

    /// `true` if the envelope failed to parse (malformed, §4.1) — callers
    /// should drop rather than admit.
    pub fn is_malformed(&self) -> bool {
        codec::unserialize_request(&self.serialized, &self.source.force_host()).is_err()
    }

    pub fn request(&self) -> &UnserializedRequest {
        self.parsed()
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.parsed().extra
    }

    pub fn request_id(&self) -> &str {
        self.request_id.get_or_init(|| {
            self.parsed()
                .extra
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
        })
    }

    pub fn response_key(&self) -> Option<String> {
        self.parsed()
            .extra
            .get("response_key")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// `big * 1e13 + local_queue_time_ms`; lower values are served first.
    pub fn priority(&self) -> i64 {
        *self.priority.get_or_init(|| {
            let big = self
                .parsed()
                .extra
                .get("priority")
                .and_then(Value::as_i64)
                .unwrap_or(5);
            big * 10_000_000_000_000 + self.local_queue_epoch_ms
        })
    }

    /// `now - extra.creation_time`, clamped to >= 0.
    pub fn lifetime_ms(&self) -> i64 {
        let creation = self
            .parsed()
            .extra
            .get("creation_time")
            .and_then(Value::as_i64)
            .map(|secs| secs * 1000)
            .unwrap_or_else(now_epoch_ms);
        (now_epoch_ms() - creation).max(0)
    }

    pub fn lifetime_in_local_queue_ms(&self) -> i64 {
        self.local_queue_time.elapsed().as_millis() as i64
    }
}

impl RequestView for HttpRequestExchange {
    fn method(&self) -> &str {
        &self.parsed().method
    }

    fn path(&self) -> &str {
        &self.parsed().path
    }

    fn remote_ip(&self) -> Option<&str> {
        self.parsed()
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("x-forwarded-for"))
            .map(|(_, v)| v.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.parsed()
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn source() -> SourceQueue {
        SourceQueue {
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_unix_socket: None,
            list_name: "q".to_string(),
            upstream_host: "backend".to_string(),
            upstream_port: 9000,
            upstream_unix_socket: None,
        }
    }

    #[test]
    fn priority_favors_low_big_value() {
        let wire = codec::serialize_request(
            "GET",
            "/x",
            "h",
            "1.1.1.1",
            IndexMap::new(),
            vec![],
            None,
            None,
            None,
            serde_json::json!({"priority": 1}).as_object().unwrap().clone(),
        );
        let exchange = HttpRequestExchange::new(wire, source());
        let low_big = exchange.priority();

        let wire = codec::serialize_request(
            "GET",
            "/x",
            "h",
            "1.1.1.1",
            IndexMap::new(),
            vec![],
            None,
            None,
            None,
            serde_json::json!({"priority": 90}).as_object().unwrap().clone(),
        );
        let exchange = HttpRequestExchange::new(wire, source());
        let high_big = exchange.priority();
        assert!(low_big < high_big);
    }

    #[test]
    fn lifetime_is_clamped_non_negative() {
        let wire = codec::serialize_request(
            "GET", "/x", "h", "1.1.1.1", IndexMap::new(), vec![], None, None, None,
            serde_json::json!({"creation_time": now_epoch_ms() / 1000 + 1000}).as_object().unwrap().clone(),
        );
        let exchange = HttpRequestExchange::new(wire, source());
        assert_eq!(exchange.lifetime_ms(), 0);
    }
}
