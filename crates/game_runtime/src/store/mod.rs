//! Sharded write-behind persistence.
//!
//! Handlers submit [`Mutation`]s; the store coalesces them per dedup key and
//! commits them in batches, one transaction per shard per flush.
//!
//! ```text
//! submit(batch) ──► bounded inbound queue ──► dispatcher task
//!                                               │ shard = batch[0].shard
//!                                               │ (worker created lazily)
//!                       ┌───────────────────────┼──────────────────────┐
//!                       ▼                       ▼                      ▼
//!                 shard worker 0          shard worker 1    ...  shard worker N
//!                 cache: key → latest     cache: key → latest
//!                 flush: begin/apply/commit, rollback + discard on failure
//!
//! reaper tick: one registered shard per tick, round-robin; a shard with an
//! empty queue and cache that has been idle past the grace period is stopped
//! (final flush) and removed from the registry.
//! ```
//!
//! Closing the store drops the inbound queue's sender. The dispatcher then
//! routes what is still queued, tells every shard to flush one last time and
//! exits.

mod database;
mod message;
mod shard;

pub use database::{Database, MemoryDatabase, Transaction};
pub use message::{
    default_shard_count, shard_for, ApplyWrite, DedupKey, Mutation, ShardId, Statement,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::status::StatusReport;
use crate::supervisor::{Supervisor, TaskOutcome};
use shard::{ShardCommand, ShardGauge, ShardWorker};

/// Sizing and timing of a [`WriteBehindStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub shard_count: usize,
    /// Capacity of the inbound batch queue.
    pub queue_capacity: usize,
    pub flush_interval: Duration,
    pub reap_interval: Duration,
    /// Grace period before an idle, drained shard is reaped.
    pub idle_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            queue_capacity: 1024,
            flush_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Store-wide counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub(crate) batches: AtomicU64,
    pub(crate) superseded: AtomicU64,
    pub(crate) applied: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) failed_flushes: AtomicU64,
    pub(crate) reaped: AtomicU64,
    pub(crate) active_shards: AtomicUsize,
}

impl StoreStats {
    /// Batches routed to a shard.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Mutations replaced by a newer one for the same key before a flush.
    pub fn superseded(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }

    /// Mutations applied by successful flushes.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Successful flushes (one commit each).
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }

    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }

    pub fn active_shards(&self) -> usize {
        self.active_shards.load(Ordering::Relaxed)
    }
}

enum StoreCommand {
    Batch(Vec<Mutation>),
    FlushAll(oneshot::Sender<usize>),
}

pub struct WriteBehindStore {
    inbound: Mutex<Option<mpsc::Sender<StoreCommand>>>,
    supervisor: Supervisor,
    stats: Arc<StoreStats>,
    shard_count: usize,
}

impl WriteBehindStore {
    /// Starts the dispatcher.
    ///
    /// The store has its own supervisor; only [`close`](Self::close) stops it.
    pub fn start(config: StoreConfig, db: Arc<dyn Database>) -> Self {
        let supervisor = Supervisor::new("write-behind");
        let stats = Arc::new(StoreStats::default());
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shard_count = config.shard_count.max(1);

        let dispatcher = StoreDispatcher {
            config,
            db,
            supervisor: supervisor.clone(),
            stats: stats.clone(),
            shards: HashMap::new(),
            order: Vec::new(),
            cursor: 0,
        };
        supervisor.spawn(move |token| dispatcher.run(rx, token));
        info!("write-behind store started with {} shard slot(s)", shard_count);

        Self {
            inbound: Mutex::new(Some(tx)),
            supervisor,
            stats,
            shard_count,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Shard for `owner` under this store's shard count.
    pub fn shard_for(&self, owner: i64) -> ShardId {
        shard_for(owner, self.shard_count)
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_err()
    }

    fn sender(&self) -> Result<mpsc::Sender<StoreCommand>, StoreError> {
        self.inbound
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(StoreError::Closed)
    }

    /// Queues a batch. The whole batch goes to the shard of its first
    /// mutation. Waits while the inbound queue is full.
    pub async fn submit(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.sender()?
            .send(StoreCommand::Batch(batch))
            .await
            .map_err(|_| StoreError::Closed)
    }

    pub async fn enqueue(&self, mutation: Mutation) -> Result<(), StoreError> {
        self.submit(vec![mutation]).await
    }

    /// Flushes every live shard and returns how many were flushed.
    ///
    /// Batches submitted before this call are flushed too.
    pub async fn flush_all(&self) -> Result<usize, StoreError> {
        let (ack, done) = oneshot::channel();
        self.sender()?
            .send(StoreCommand::FlushAll(ack))
            .await
            .map_err(|_| StoreError::Closed)?;
        done.await.map_err(|_| StoreError::Closed)
    }

    /// Stops accepting batches and waits until every shard has performed
    /// its final flush.
    pub async fn close(&self) {
        let sender = self.inbound.lock().ok().and_then(|mut slot| slot.take());
        if sender.is_none() {
            return;
        }
        drop(sender);
        self.supervisor.wait().await;
        info!("write-behind store closed: {}", self.status_line());
    }
}

impl StatusReport for WriteBehindStore {
    fn status_line(&self) -> String {
        format!(
            "store: {}/{}/{} (shards/flushes/batches)",
            self.stats.active_shards(),
            self.stats.flushes(),
            self.stats.batches()
        )
    }
}

struct ShardHandle {
    commands: mpsc::UnboundedSender<ShardCommand>,
    gauge: Arc<ShardGauge>,
    task: JoinHandle<TaskOutcome>,
}

struct StoreDispatcher {
    config: StoreConfig,
    db: Arc<dyn Database>,
    supervisor: Supervisor,
    stats: Arc<StoreStats>,
    shards: HashMap<ShardId, ShardHandle>,
    order: Vec<ShardId>,
    cursor: usize,
}

impl StoreDispatcher {
    async fn run(mut self, mut inbound: mpsc::Receiver<StoreCommand>, token: CancellationToken) {
        let mut reap = tokio::time::interval(self.config.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Skip);
        reap.tick().await;

        loop {
            tokio::select! {
                command = inbound.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = reap.tick() => self.reap_next().await,
                _ = token.cancelled() => break,
            }
        }

        inbound.close();
        while let Ok(command) = inbound.try_recv() {
            self.handle(command);
        }
        self.stop_all().await;
    }

    fn handle(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::Batch(batch) => self.route(batch),
            StoreCommand::FlushAll(ack) => self.flush_all(ack),
        }
    }

    fn route(&mut self, batch: Vec<Mutation>) {
        let Some(first) = batch.first() else { return };
        let id = first.shard;
        let shard = self.shard(id);
        shard.gauge.enqueued();
        if shard.commands.send(ShardCommand::Batch(batch)).is_err() {
            warn!("shard {} is gone, batch dropped", id);
            return;
        }
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn shard(&mut self, id: ShardId) -> &ShardHandle {
        if !self.shards.contains_key(&id) {
            let (commands, rx) = mpsc::unbounded_channel();
            let gauge = Arc::new(ShardGauge::new());
            let worker = ShardWorker::new(
                id,
                self.db.clone(),
                self.config.flush_interval,
                gauge.clone(),
                self.stats.clone(),
            );
            let task = self.supervisor.spawn(move |token| worker.run(rx, token));
            self.shards.insert(
                id,
                ShardHandle {
                    commands,
                    gauge,
                    task,
                },
            );
            self.order.push(id);
            self.stats.active_shards.fetch_add(1, Ordering::Relaxed);
            debug!("shard {} created", id);
        }
        &self.shards[&id]
    }

    fn flush_all(&self, ack: oneshot::Sender<usize>) {
        let mut pending = Vec::with_capacity(self.shards.len());
        for shard in self.shards.values() {
            let (done, wait) = oneshot::channel();
            if shard.commands.send(ShardCommand::Flush(done)).is_ok() {
                pending.push(wait);
            }
        }
        self.supervisor.spawn(move |_| async move {
            let flushed = join_all(pending)
                .await
                .into_iter()
                .filter(Result::is_ok)
                .count();
            let _ = ack.send(flushed);
        });
    }

    /// Inspects the next shard in round-robin order and stops it when it is
    /// drained and idle past the grace period.
    async fn reap_next(&mut self) {
        if self.order.is_empty() {
            return;
        }
        self.cursor %= self.order.len();
        let id = self.order[self.cursor];
        let reapable = self
            .shards
            .get(&id)
            .map(|s| s.gauge.is_drained() && s.gauge.idle_for() > self.config.idle_timeout)
            .unwrap_or(true);
        if !reapable {
            self.cursor += 1;
            return;
        }

        self.order.remove(self.cursor);
        if let Some(shard) = self.shards.remove(&id) {
            self.stop(id, shard).await;
            self.stats.reaped.fetch_add(1, Ordering::Relaxed);
            debug!("shard {} reaped", id);
        }
    }

    async fn stop(&self, id: ShardId, shard: ShardHandle) {
        let ShardHandle { commands, task, .. } = shard;
        drop(commands);
        match task.await {
            Ok(TaskOutcome::Failed(e)) => warn!("shard {} failed: {}", id, e),
            Ok(_) => {}
            Err(e) => warn!("shard {} task lost: {}", id, e),
        }
        self.stats.active_shards.fetch_sub(1, Ordering::Relaxed);
    }

    async fn stop_all(&mut self) {
        let shards: Vec<(ShardId, ShardHandle)> = self.shards.drain().collect();
        self.order.clear();
        let stops = shards
            .into_iter()
            .map(|(id, shard)| self.stop(id, shard));
        join_all(stops).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> StoreConfig {
        StoreConfig {
            shard_count: 4,
            queue_capacity: 16,
            flush_interval: Duration::from_millis(50),
            reap_interval: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(60),
        }
    }

    fn upsert(owner: i64, value: &str) -> Mutation {
        Mutation::statement(
            shard_for(owner, 4),
            DedupKey::new(owner, "account", owner),
            "UPSERT account",
            vec![json!(owner), json!({ "value": value })],
        )
    }

    #[tokio::test]
    async fn flush_all_commits_pending_mutations() {
        let db = MemoryDatabase::new();
        let store = WriteBehindStore::start(config(), Arc::new(db.clone()));

        store.enqueue(upsert(1, "a")).await.unwrap();
        store.enqueue(upsert(2, "b")).await.unwrap();
        assert_eq!(store.flush_all().await.unwrap(), 2);

        assert_eq!(db.get("account", "1"), Some(json!({"value": "a"})));
        assert_eq!(db.get("account", "2"), Some(json!({"value": "b"})));
        assert_eq!(store.stats().active_shards(), 2);
        assert_eq!(store.stats().batches(), 2);
        store.close().await;
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let store = WriteBehindStore::start(config(), Arc::new(MemoryDatabase::new()));
        store.close().await;
        assert!(store.is_closed());
        assert_eq!(store.enqueue(upsert(1, "a")).await, Err(StoreError::Closed));
        assert_eq!(store.flush_all().await, Err(StoreError::Closed));
        assert!(store.submit(Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn empty_store_status_line() {
        let store = WriteBehindStore::start(config(), Arc::new(MemoryDatabase::new()));
        assert_eq!(store.status_line(), "store: 0/0/0 (shards/flushes/batches)");
        assert_eq!(store.flush_all().await.unwrap(), 0);
        store.close().await;
    }
}
