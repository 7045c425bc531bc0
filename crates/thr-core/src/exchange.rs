//! `HttpExchange`: the frontend's mutable per-request value (§3).

use indexmap::IndexMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::limits::RequestView;

#[derive(Debug, Clone, Default)]
pub struct ExchangeRequest {
    pub method: String,
    pub path: String,
    pub host: String,
    pub remote_ip: String,
    pub query_arguments: IndexMap<String, Vec<String>>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeResponse {
    pub status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// The redis bus target for a request, mutable via rule actions.
#[derive(Debug, Clone)]
pub struct RedisTarget {
    pub host: String,
    pub port: u16,
    pub unix_socket: Option<String>,
    pub queue: String,
}

/// The frontend's per-request exchange: request view + response under
/// construction + routing metadata. Mutated by rule actions and by response
/// readback; destroyed once the HTTP reply is flushed.
pub struct HttpExchange {
    pub request: ExchangeRequest,
    pub response: ExchangeResponse,
    pub priority: u8,
    pub request_id: String,
    pub redis: RedisTarget,
    pub output_default_body: Option<Vec<u8>>,
    pub matched_rules: Option<Vec<usize>>,
    pub keyvalues: Map<String, Value>,
}

impl HttpExchange {
    pub fn new(
        request: ExchangeRequest,
        default_redis_host: String,
        default_redis_port: u16,
        default_redis_queue: String,
        default_redis_uds: Option<String>,
    ) -> Self {
        Self {
            request,
            response: ExchangeResponse::default(),
            priority: 50,
            request_id: Uuid::new_v4().simple().to_string(),
            redis: RedisTarget {
                host: default_redis_host,
                port: default_redis_port,
                unix_socket: default_redis_uds,
                queue: default_redis_queue,
            },
            output_default_body: None,
            matched_rules: None,
            keyvalues: Map::new(),
        }
    }

    // --- getters (criterion_getters table, §9) ---

    pub fn get_method(&self) -> String {
        self.request.method.clone()
    }

    pub fn get_path(&self) -> String {
        self.request.path.clone()
    }

    pub fn get_host(&self) -> String {
        self.request.host.clone()
    }

    pub fn get_remote_ip(&self) -> String {
        self.request.remote_ip.clone()
    }

    /// `X-Real-IP` header when present, else `remote_ip`.
    pub fn get_real_ip(&self) -> String {
        self.request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("x-real-ip"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.request.remote_ip.clone())
    }

    // --- mutators (the exchange's exposed setters/adders/deleters, §4.5) ---

    pub fn set_input_header(&mut self, name: String, value: String) {
        self.request.headers.retain(|(k, _)| k != &name);
        self.request.headers.push((name, value));
    }

    pub fn add_input_header(&mut self, name: String, value: String) {
        self.request.headers.push((name, value));
    }

    pub fn del_input_header(&mut self, name: &str) {
        self.request.headers.retain(|(k, _)| k != name);
    }

    pub fn set_output_header(&mut self, name: String, value: String) {
        self.response.headers.retain(|(k, _)| k != &name);
        self.response.headers.push((name, value));
    }

    pub fn add_output_header(&mut self, name: String, value: String) {
        self.response.headers.push((name, value));
    }

    pub fn del_output_header(&mut self, name: &str) {
        self.response.headers.retain(|(k, _)| k != name);
    }

    pub fn set_status_code(&mut self, value: u16) {
        self.response.status_code = Some(value);
    }

    pub fn set_redis_queue(&mut self, value: String) {
        self.redis.queue = value;
    }

    pub fn set_redis_host(&mut self, value: String) {
        self.redis.host = value;
    }

    pub fn set_redis_port(&mut self, value: u16) {
        self.redis.port = value;
    }

    pub fn set_redis_uds(&mut self, value: String) {
        self.redis.unix_socket = Some(value);
    }

    pub fn set_path(&mut self, value: String) {
        self.request.path = value;
    }

    pub fn set_method(&mut self, value: String) {
        self.request.method = value;
    }

    pub fn set_host(&mut self, value: String) {
        self.request.host = value;
    }

    pub fn set_remote_ip(&mut self, value: String) {
        self.request.remote_ip = value;
    }

    pub fn set_input_body(&mut self, value: Vec<u8>) {
        self.request.body = value;
    }

    pub fn set_output_body(&mut self, value: Vec<u8>) {
        self.response.body = Some(value);
    }

    pub fn set_output_default_body(&mut self, value: Vec<u8>) {
        self.output_default_body = Some(value);
    }

    pub fn set_input_priority(&mut self, value: i64) {
        self.priority = value.clamp(1, 99) as u8;
    }

    pub fn add_query_string_arg(&mut self, name: String, value: String) {
        self.request.query_arguments.entry(name).or_default().push(value);
    }

    pub fn set_query_string_arg(&mut self, name: String, value: String) {
        self.request.query_arguments.insert(name, vec![value]);
    }

    pub fn del_query_string_arg(&mut self, name: &str) {
        self.request.query_arguments.shift_remove(name);
    }

    pub fn set_custom_value(&mut self, key: String, value: Value) {
        self.keyvalues.insert(key, value);
    }

    pub fn del_custom_value(&mut self, key: &str) {
        self.keyvalues.remove(key);
    }

    pub fn get_custom_value(&self, key: &str) -> Option<&Value> {
        self.keyvalues.get(key)
    }
}

impl RequestView for HttpExchange {
    fn method(&self) -> &str {
        &self.request.method
    }

    fn path(&self) -> &str {
        &self.request.path
    }

    fn remote_ip(&self) -> Option<&str> {
        Some(&self.request.remote_ip)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
