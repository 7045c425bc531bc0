//! Queue descriptors: `{redis endpoint, list names, upstream http target,
//! worker count}` (§3 "Queue descriptor").

use std::sync::Arc;

use thr_core::config::QueueSpec;
use thr_core::request_exchange::SourceQueue;

#[derive(Debug, Clone)]
pub struct QueueDescriptor {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_unix_socket: Option<String>,
    pub lists: Vec<String>,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_unix_socket: Option<String>,
    pub workers: u32,
}

impl QueueDescriptor {
    pub fn from_spec(spec: &QueueSpec) -> Self {
        Self {
            redis_host: spec.redis_host.clone(),
            redis_port: spec.redis_port,
            redis_unix_socket: spec.redis_unix_socket.clone(),
            lists: spec.lists.clone(),
            upstream_host: spec.http_host.clone(),
            upstream_port: spec.http_port,
            upstream_unix_socket: spec.http_unix_socket.clone(),
            workers: spec.workers,
        }
    }

    pub fn redis_endpoint_key(&self) -> String {
        match &self.redis_unix_socket {
            Some(uds) => uds.clone(),
            None => format!("{}:{}", self.redis_host, self.redis_port),
        }
    }

    pub fn source_queue(self: &Arc<Self>, list_name: &str) -> SourceQueue {
        SourceQueue {
            redis_host: self.redis_host.clone(),
            redis_port: self.redis_port,
            redis_unix_socket: self.redis_unix_socket.clone(),
            list_name: list_name.to_string(),
            upstream_host: self.upstream_host.clone(),
            upstream_port: self.upstream_port,
            upstream_unix_socket: self.upstream_unix_socket.clone(),
        }
    }
}
