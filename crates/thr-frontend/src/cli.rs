//! Frontend CLI (§6).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "thr-frontend", about = "HTTP-to-bus request frontend")]
pub struct FrontendArgs {
    /// JSON config file declaring rules.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    #[arg(long)]
    pub unix_socket: Option<PathBuf>,

    #[arg(long, default_value_t = 128)]
    pub backlog: u32,

    /// Per-request seconds budget for a bus round trip.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    #[arg(long, default_value = "127.0.0.1")]
    pub redis_host: String,

    #[arg(long, default_value_t = 6379)]
    pub redis_port: u16,

    #[arg(long)]
    pub redis_uds: Option<String>,

    #[arg(long, default_value = "thr:queue:default")]
    pub redis_queue: String,
}
