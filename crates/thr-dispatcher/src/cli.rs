//! Dispatcher CLI (§6).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "thr-dispatcher", about = "Bus-to-HTTP request dispatcher")]
pub struct DispatcherArgs {
    /// JSON config file declaring queues and limits.
    #[arg(long)]
    pub config: PathBuf,

    /// Per-upstream-fetch timeout, in seconds.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Max age (seconds) a request may sit before being dropped.
    #[arg(long, default_value_t = 300)]
    pub max_lifetime: u64,

    /// Max age (ms) a request may sit in a blocked queue before bus
    /// reinjection.
    #[arg(long, default_value_t = 1000)]
    pub max_local_queue_lifetime_ms: u64,

    /// Per-counter blocked queue capacity before bus reinjection.
    #[arg(long, default_value_t = 20)]
    pub blocked_queue_max_size: usize,

    #[arg(long, default_value = "/tmp/redis2http_stats.json")]
    pub stats_file: PathBuf,

    #[arg(long, default_value_t = 2000)]
    pub stats_frequency_ms: u64,

    /// Stamp `X-Thr-Bus: 1` on outbound upstream requests.
    #[arg(long, default_value_t = false)]
    pub add_thr_extra_headers: bool,
}
