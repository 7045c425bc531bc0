//! Scheduler-owned state: counters, blocked queues, bus-reinject queues,
//! running/blocked-exchange maps, shutdown phase (§3, §5).
//!
//! None of this is behind a lock. It's owned exclusively by the single
//! task spawned in `scheduler::run`, reached only through an mpsc command
//! channel — giving the same "one serialized worker" atomicity the spec
//! calls for (§5) as an actor rather than a mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thr_core::counters::Counters;
use thr_core::limits::LimitsRegistry;
use thr_core::request_exchange::HttpRequestExchange;

static SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

pub type PriorityKey = (i64, u64);

/// A bounded priority queue of exchanges that tripped one counter.
#[derive(Default)]
pub struct BlockedQueue {
    items: BTreeMap<PriorityKey, Arc<HttpRequestExchange>>,
    max_size: usize,
}

impl BlockedQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: BTreeMap::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `false` (overflow) without inserting if already at capacity.
    pub fn try_push(&mut self, exchange: Arc<HttpRequestExchange>) -> bool {
        if self.items.len() >= self.max_size {
            return false;
        }
        self.items
            .insert((exchange.priority(), next_seq()), exchange);
        true
    }

    /// Removes every item, smallest-priority first.
    pub fn drain_all(&mut self) -> Vec<Arc<HttpRequestExchange>> {
        std::mem::take(&mut self.items).into_values().collect()
    }

    /// Puts back items that were drained but not consumed (preserves their
    /// original priority ordering).
    pub fn put_back(&mut self, items: Vec<Arc<HttpRequestExchange>>) {
        for exchange in items {
            self.items
                .insert((exchange.priority(), next_seq()), exchange);
        }
    }

    pub fn remove_request(&mut self, request_id: &str) {
        self.items
            .retain(|_, exchange| exchange.request_id() != request_id);
    }
}

/// Per-redis-endpoint unbounded priority queue of exchanges awaiting
/// re-`LPUSH`.
#[derive(Default)]
pub struct BusReinjectQueue {
    items: BTreeMap<PriorityKey, Arc<HttpRequestExchange>>,
}

impl BusReinjectQueue {
    pub fn push(&mut self, exchange: Arc<HttpRequestExchange>) {
        self.items
            .insert((exchange.priority(), next_seq()), exchange);
    }

    pub fn pop(&mut self) -> Option<Arc<HttpRequestExchange>> {
        self.items
            .keys()
            .next()
            .copied()
            .and_then(|k| self.items.remove(&k))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Default, Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub total_request_counter: u64,
    pub expired_request_counter: u64,
    pub bus_reinject_counter: u64,
}

/// One running request's stats-writer row: method/url/age/priority (§4.7
/// "Stats writer").
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunningRequestStat {
    pub method: String,
    pub url: String,
    pub age_ms: i64,
    pub priority: i64,
}

/// Per-limit `{limit, value, blocks, queue}` breakdown. For per-value
/// limits, `globalvalue`/`globalblocks` replace `value`/`blocks` and
/// collapse every distinct hash value's counter into one summed figure.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LimitStat {
    pub limit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub globalvalue: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub globalblocks: Option<u64>,
    pub queue: usize,
}

/// Full JSON snapshot the stats writer serializes every `stats_frequency_ms`
/// (§4.7 "Stats writer").
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub epoch: u64,
    pub shutdown_phase: u8,
    pub total_request_counter: u64,
    pub expired_request_counter: u64,
    pub bus_reinject_counter: u64,
    pub bus_reinject_queue_sizes: HashMap<String, usize>,
    pub running: HashMap<String, RunningRequestStat>,
    pub blocked_count: usize,
    pub running_count: usize,
    pub limits: Vec<LimitStat>,
}

impl StatsSnapshot {
    pub fn empty(epoch: u64) -> Self {
        Self {
            epoch,
            shutdown_phase: 0,
            total_request_counter: 0,
            expired_request_counter: 0,
            bus_reinject_counter: 0,
            bus_reinject_queue_sizes: HashMap::new(),
            running: HashMap::new(),
            blocked_count: 0,
            running_count: 0,
            limits: Vec::new(),
        }
    }
}

/// Shutdown state machine phases (§4.7): 0 running .. 5 event loop stopped.
pub struct SchedulerCore {
    pub counters: Counters,
    pub limits: LimitsRegistry,
    pub blocked_queues: HashMap<String, BlockedQueue>,
    pub bus_reinject_queues: HashMap<String, BusReinjectQueue>,
    pub running: HashMap<String, (Instant, Arc<HttpRequestExchange>)>,
    pub blocked_exchanges: HashMap<String, (String, Arc<HttpRequestExchange>)>,
    pub stats: Stats,
    pub blocked_queue_max_size: usize,
    pub max_lifetime_ms: i64,
    pub max_local_queue_lifetime_ms: i64,
}

impl SchedulerCore {
    pub fn new(
        limits: LimitsRegistry,
        blocked_queue_max_size: usize,
        max_lifetime_ms: i64,
        max_local_queue_lifetime_ms: i64,
    ) -> Self {
        Self {
            counters: Counters::new(),
            limits,
            blocked_queues: HashMap::new(),
            bus_reinject_queues: HashMap::new(),
            running: HashMap::new(),
            blocked_exchanges: HashMap::new(),
            stats: Stats::default(),
            blocked_queue_max_size,
            max_lifetime_ms,
            max_local_queue_lifetime_ms,
        }
    }

    pub fn blocked_queue_mut(&mut self, counter: &str) -> &mut BlockedQueue {
        let max = self.blocked_queue_max_size;
        self.blocked_queues
            .entry(counter.to_string())
            .or_insert_with(|| BlockedQueue::new(max))
    }

    pub fn bus_reinject_queue_mut(&mut self, endpoint: &str) -> &mut BusReinjectQueue {
        self.bus_reinject_queues
            .entry(endpoint.to_string())
            .or_default()
    }

    /// Builds the stats writer's JSON snapshot (§4.7) as of right now.
    pub fn snapshot(&self, epoch: u64, shutdown_phase: u8) -> StatsSnapshot {
        let bus_reinject_queue_sizes = self
            .bus_reinject_queues
            .iter()
            .map(|(endpoint, queue)| (endpoint.clone(), queue.len()))
            .collect();

        let running = self
            .running
            .iter()
            .map(|(request_id, (started_at, exchange))| {
                let request = exchange.request();
                (
                    request_id.clone(),
                    RunningRequestStat {
                        method: request.method.clone(),
                        url: request.path.clone(),
                        age_ms: started_at.elapsed().as_millis() as i64,
                        priority: exchange.priority(),
                    },
                )
            })
            .collect();

        let mut per_value_totals: HashMap<&str, (u64, u64, usize)> = HashMap::new();
        let mut limits = Vec::new();
        for limit in self.limits.limits() {
            if !limit.show_in_stats {
                continue;
            }
            if limit.per_value {
                let entry = per_value_totals.entry(&limit.name).or_default();
                continue_accumulate_per_value(self, &limit.name, entry);
                continue;
            }
            let queue = self
                .blocked_queues
                .get(&limit.name)
                .map(|q| q.len())
                .unwrap_or(0);
            limits.push(LimitStat {
                limit: limit.name.clone(),
                value: Some(self.counters.get(&limit.name)),
                blocks: Some(self.counters.get_block_count(&limit.name)),
                globalvalue: None,
                globalblocks: None,
                queue,
            });
        }
        for (name, (value, blocks, queue)) in per_value_totals {
            limits.push(LimitStat {
                limit: name.to_string(),
                value: None,
                blocks: None,
                globalvalue: Some(value),
                globalblocks: Some(blocks),
                queue,
            });
        }

        StatsSnapshot {
            epoch,
            shutdown_phase,
            total_request_counter: self.stats.total_request_counter,
            expired_request_counter: self.stats.expired_request_counter,
            bus_reinject_counter: self.stats.bus_reinject_counter,
            bus_reinject_queue_sizes,
            running,
            blocked_count: self.blocked_exchanges.len(),
            running_count: self.running.len(),
            limits,
        }
    }
}

/// Sums a per-value limit's counters/blocks/queues across every distinct
/// hash value seen so far (`"{limit}=={value}"` counter names), since the
/// per-value breakdown collapses to one global figure per §4.7.
fn continue_accumulate_per_value(core: &SchedulerCore, limit_name: &str, entry: &mut (u64, u64, usize)) {
    let prefix = format!("{limit_name}==");
    let matching: std::collections::HashSet<&str> = core
        .counters
        .names()
        .filter(|name| name.starts_with(&prefix))
        .collect();
    for name in matching {
        entry.0 += core.counters.get(name);
        entry.1 += core.counters.get_block_count(name);
    }
    for (name, queue) in &core.blocked_queues {
        if name.starts_with(&prefix) {
            entry.2 += queue.len();
        }
    }
}
