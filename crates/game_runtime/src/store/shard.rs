//! Shard worker: owns one slice of pending mutations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::database::Database;
use super::message::{ApplyWrite, DedupKey, Mutation, ShardId};
use super::StoreStats;
use crate::error::StoreError;

pub(crate) enum ShardCommand {
    Batch(Vec<Mutation>),
    Flush(oneshot::Sender<()>),
}

/// Counters the dispatcher reads to decide whether a shard is idle.
#[derive(Debug)]
pub(crate) struct ShardGauge {
    epoch: Instant,
    queued: AtomicUsize,
    cached: AtomicUsize,
    last_active_ms: AtomicU64,
}

impl ShardGauge {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            queued: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
            last_active_ms: AtomicU64::new(0),
        }
    }

    /// Records a batch routed to the shard.
    pub(crate) fn enqueued(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.last_active_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Nothing queued and nothing waiting for a flush.
    pub(crate) fn is_drained(&self) -> bool {
        self.queued.load(Ordering::Acquire) == 0 && self.cached.load(Ordering::Acquire) == 0
    }
}

pub(crate) struct ShardWorker {
    id: ShardId,
    db: Arc<dyn Database>,
    flush_interval: Duration,
    gauge: Arc<ShardGauge>,
    stats: Arc<StoreStats>,
    cache: HashMap<DedupKey, (u64, Arc<dyn ApplyWrite>)>,
    seq: u64,
}

impl ShardWorker {
    pub(crate) fn new(
        id: ShardId,
        db: Arc<dyn Database>,
        flush_interval: Duration,
        gauge: Arc<ShardGauge>,
        stats: Arc<StoreStats>,
    ) -> Self {
        Self {
            id,
            db,
            flush_interval,
            gauge,
            stats,
            cache: HashMap::new(),
            seq: 0,
        }
    }

    /// Consumes commands until the channel closes or `token` is cancelled,
    /// then absorbs whatever is still queued and flushes one last time.
    ///
    /// The flush deadline is armed when the cache goes from empty to
    /// non-empty and disarmed by every flush.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ShardCommand>,
        token: CancellationToken,
    ) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, &mut deadline).await,
                    None => break,
                },
                _ = until(deadline) => {
                    self.flush().await;
                    deadline = None;
                }
                _ = token.cancelled() => break,
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.handle(command, &mut deadline).await;
        }
        self.flush().await;
        debug!("shard {} stopped", self.id);
    }

    async fn handle(&mut self, command: ShardCommand, deadline: &mut Option<Instant>) {
        match command {
            ShardCommand::Batch(batch) => {
                let was_empty = self.cache.is_empty();
                self.absorb(batch);
                if was_empty && !self.cache.is_empty() {
                    *deadline = Some(Instant::now() + self.flush_interval);
                }
            }
            ShardCommand::Flush(ack) => {
                self.flush().await;
                *deadline = None;
                let _ = ack.send(());
            }
        }
    }

    fn absorb(&mut self, batch: Vec<Mutation>) {
        for mutation in batch {
            self.seq += 1;
            if mutation.shard != self.id {
                warn!(
                    "shard {} received mutation {} addressed to shard {}",
                    self.id, mutation.key, mutation.shard
                );
            }
            if self
                .cache
                .insert(mutation.key, (self.seq, mutation.write))
                .is_some()
            {
                self.stats.superseded.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.gauge.cached.store(self.cache.len(), Ordering::Release);
        self.gauge.queued.fetch_sub(1, Ordering::AcqRel);
    }

    /// Applies every cached mutation in one transaction.
    ///
    /// A failure rolls the transaction back and discards the batch.
    async fn flush(&mut self) {
        if self.cache.is_empty() {
            return;
        }
        let mut batch: Vec<(u64, DedupKey, Arc<dyn ApplyWrite>)> = self
            .cache
            .drain()
            .map(|(key, (seq, write))| (seq, key, write))
            .collect();
        self.gauge.cached.store(0, Ordering::Release);
        batch.sort_unstable_by_key(|(seq, _, _)| *seq);

        match self.commit(&batch).await {
            Ok(()) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .applied
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!("shard {} committed {} mutation(s)", self.id, batch.len());
            }
            Err(e) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(
                    "shard {} discarded {} mutation(s) after failed flush: {}",
                    self.id,
                    batch.len(),
                    e
                );
            }
        }
    }

    async fn commit(&self, batch: &[(u64, DedupKey, Arc<dyn ApplyWrite>)]) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;
        for (_, key, write) in batch {
            if let Err(e) = write.apply(tx.as_mut()).await {
                warn!("shard {} write {} failed, rolling back", self.id, key);
                if let Err(rollback) = tx.rollback().await {
                    error!("shard {} rollback failed: {}", self.id, rollback);
                }
                return Err(e);
            }
        }
        tx.commit().await
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
