mod bus_writer;
mod cli;
mod process;
mod queue;
mod scheduler;
mod shutdown;
mod state;
mod sweeper;
mod stats_writer;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thr_core::config::ConfigFile;
use tokio::sync::watch;
use tracing::info;

use cli::DispatcherArgs;
use process::ProcessConfig;
use queue::QueueDescriptor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = DispatcherArgs::parse();

    let config = ConfigFile::load(&args.config)?;
    let limits = config.build_limits()?;
    let queues: Vec<Arc<QueueDescriptor>> = config
        .queues
        .iter()
        .map(|spec| Arc::new(QueueDescriptor::from_spec(spec)))
        .collect();

    let (phase_tx, phase_rx) = watch::channel(0u8);
    let scheduler = scheduler::spawn(
        limits,
        args.blocked_queue_max_size,
        args.max_lifetime as i64 * 1000,
        args.max_local_queue_lifetime_ms as i64,
        phase_rx.clone(),
    );

    let process_config = Arc::new(ProcessConfig {
        upstream_timeout: Duration::from_secs(args.timeout),
        add_thr_extra_headers: args.add_thr_extra_headers,
    });
    let http_client = process::build_client();

    let mut redis_clients: std::collections::HashMap<String, redis::Client> =
        std::collections::HashMap::new();
    for queue in &queues {
        let key = queue.redis_endpoint_key();
        redis_clients.entry(key).or_insert_with(|| {
            let url = match &queue.redis_unix_socket {
                Some(path) => format!("redis+unix://{path}"),
                None => format!("redis://{}:{}", queue.redis_host, queue.redis_port),
            };
            redis::Client::open(url).expect("invalid redis url in queue config")
        });
    }

    let mut puller_handles = Vec::new();
    for queue in &queues {
        let redis_client = redis_clients[&queue.redis_endpoint_key()].clone();
        let queue_client = match &queue.upstream_unix_socket {
            Some(path) => process::build_unix_socket_client(path),
            None => http_client.clone(),
        };
        for _worker in 0..queue.workers {
            let conn = redis_client.get_multiplexed_tokio_connection().await?;
            puller_handles.push(tokio::spawn(process::puller_loop(
                conn,
                queue.clone(),
                queue.lists.clone(),
                scheduler.clone(),
                queue_client.clone(),
                redis_client.clone(),
                process_config.clone(),
                phase_rx.clone(),
            )));
        }
    }

    for (endpoint, redis_client) in &redis_clients {
        tokio::spawn(bus_writer::run(
            endpoint.clone(),
            redis_client.clone(),
            scheduler.clone(),
            phase_rx.clone(),
        ));
    }

    tokio::spawn(sweeper::run(scheduler.clone(), phase_rx.clone()));
    tokio::spawn(stats_writer::run(
        scheduler.clone(),
        args.stats_file.clone(),
        args.stats_frequency_ms,
        phase_rx.clone(),
    ));

    info!(queues = queues.len(), "thr-dispatcher started");
    shutdown::run(phase_tx, scheduler, puller_handles).await;
    Ok(())
}
