use std::sync::Arc;
use std::time::Duration;

use thr_core::rules::RuleSet;

use crate::redis_pool::RedisPool;

#[derive(Clone)]
pub struct AppState {
    pub rules: Arc<RuleSet>,
    pub redis: Arc<RedisPool>,
    pub default_redis_host: String,
    pub default_redis_port: u16,
    pub default_redis_uds: Option<String>,
    pub default_redis_queue: String,
    pub timeout: Duration,
}
