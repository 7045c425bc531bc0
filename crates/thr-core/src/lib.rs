//! Shared core for the thr dispatcher pair: wire codec, matchers, counters,
//! limits registry, rule engine, and the two exchange types (§2 of the
//! spec).

pub mod codec;
pub mod config;
pub mod counters;
pub mod exchange;
pub mod handlers;
pub mod limits;
pub mod matchers;
pub mod request_exchange;
pub mod rules;

pub const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_REDIS_QUEUE: &str = "thr:queue:default";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_BLOCKED_QUEUE_MAX_SIZE: usize = 20;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 300;
pub const DEFAULT_MAX_LOCAL_QUEUE_LIFETIME_MS: u64 = 1000;
pub const BRPOP_TIMEOUT_SECS: u64 = 5;
