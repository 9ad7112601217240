//! Write-behind store behavior against the in-memory database.

use std::sync::Arc;
use std::time::Duration;

use game_runtime::store::{shard_for, ShardId};
use game_runtime::{
    async_trait, json, Database, DedupKey, MemoryDatabase, Mutation, StoreConfig, StoreError,
    Transaction, Value, WriteBehindStore,
};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

const SHARDS: usize = 8;

fn config() -> StoreConfig {
    StoreConfig {
        shard_count: SHARDS,
        queue_capacity: 64,
        flush_interval: Duration::from_secs(60),
        reap_interval: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(60),
    }
}

fn start(config: StoreConfig) -> (WriteBehindStore, MemoryDatabase) {
    let db = MemoryDatabase::new();
    let store = WriteBehindStore::start(config, Arc::new(db.clone()));
    (store, db)
}

fn password(owner: i64, value: &str) -> Mutation {
    Mutation::statement(
        shard_for(owner, SHARDS),
        DedupKey::new(owner, "account", owner),
        "UPSERT account",
        vec![json!(owner), json!({ "password": value })],
    )
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(3), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn writes_to_one_key_coalesce_into_the_latest() {
    let (store, db) = start(config());

    assert_eq!(DedupKey::new(42, "account", 42).as_str(), "42_account_42");
    store.enqueue(password(42, "a")).await.unwrap();
    store.enqueue(password(42, "b")).await.unwrap();
    assert_eq!(store.flush_all().await.unwrap(), 1);

    assert_eq!(db.get("account", "42"), Some(json!({"password": "b"})));
    assert_eq!(db.commits(), 1);
    assert_eq!(db.journal(), vec!["UPSERT account".to_string()]);
    assert_eq!(store.stats().superseded(), 1);
    assert_eq!(store.stats().applied(), 1);
    store.close().await;
}

#[tokio::test]
async fn failed_flush_rolls_back_and_discards_the_batch() {
    let (store, db) = start(config());

    db.fail_next_commit();
    store.enqueue(password(1, "lost")).await.unwrap();
    store.flush_all().await.unwrap();
    assert_eq!(db.get("account", "1"), None);
    assert_eq!(db.rollbacks(), 1);
    assert_eq!(store.stats().failed_flushes(), 1);

    // Nothing is retried; the next flush only carries new writes.
    store.enqueue(password(2, "kept")).await.unwrap();
    store.flush_all().await.unwrap();
    assert_eq!(db.get("account", "1"), None);
    assert_eq!(db.get("account", "2"), Some(json!({"password": "kept"})));
    assert_eq!(db.commits(), 1);
    store.close().await;
}

#[tokio::test]
async fn a_failing_shard_does_not_affect_others() {
    let (store, db) = start(config());
    let broken: ShardId = 1;
    let healthy: ShardId = 2;

    store
        .enqueue(Mutation::statement(
            broken,
            DedupKey::new(1, "account", 1),
            "TRUNCATE everything now",
            Vec::<Value>::new(),
        ))
        .await
        .unwrap();
    store
        .enqueue(Mutation::statement(
            healthy,
            DedupKey::new(2, "account", 2),
            "UPSERT account",
            vec![json!(2), json!({"password": "x"})],
        ))
        .await
        .unwrap();

    assert_eq!(store.flush_all().await.unwrap(), 2);
    assert_eq!(db.commits(), 1);
    assert_eq!(db.rollbacks(), 1);
    assert_eq!(db.get("account", "2"), Some(json!({"password": "x"})));
    store.close().await;
}

#[tokio::test]
async fn batch_is_routed_by_its_first_mutation() {
    let (store, db) = start(config());

    store
        .submit(vec![
            Mutation::statement(3, DedupKey::new(3, "account", 3), "UPSERT account", vec![json!(3), json!({})]),
            Mutation::statement(4, DedupKey::new(4, "account", 4), "UPSERT account", vec![json!(4), json!({})]),
        ])
        .await
        .unwrap();

    assert_eq!(store.flush_all().await.unwrap(), 1);
    assert_eq!(store.stats().active_shards(), 1);
    assert_eq!(db.commits(), 1);
    assert_eq!(db.row_count("account"), 2);
    store.close().await;
}

#[tokio::test]
async fn flush_applies_writes_in_arrival_order() {
    let (store, db) = start(config());
    let shard = shard_for(7, SHARDS);

    store.enqueue(password(7, "first")).await.unwrap();
    store
        .enqueue(Mutation::statement(
            shard,
            DedupKey::new(7, "account_delete", 7),
            "DELETE account",
            vec![json!(7)],
        ))
        .await
        .unwrap();
    store.flush_all().await.unwrap();

    assert_eq!(db.journal(), vec!["UPSERT account", "DELETE account"]);
    assert_eq!(db.get("account", "7"), None);
    store.close().await;
}

#[tokio::test]
async fn pending_writes_flush_after_the_interval() {
    let (store, db) = start(StoreConfig {
        flush_interval: Duration::from_millis(50),
        ..config()
    });

    store.enqueue(password(5, "timed")).await.unwrap();
    eventually("timed flush", || db.get("account", "5").is_some()).await;
    assert_eq!(store.stats().flushes(), 1);
    store.close().await;
}

#[tokio::test]
async fn idle_shards_are_reaped_while_busy_ones_survive() {
    let (store, db) = start(StoreConfig {
        flush_interval: Duration::from_millis(20),
        reap_interval: Duration::from_millis(10),
        idle_timeout: Duration::from_millis(150),
        ..config()
    });

    let quiet = 1;
    let busy = 2;
    assert_ne!(shard_for(quiet, SHARDS), shard_for(busy, SHARDS));
    store.enqueue(password(quiet, "once")).await.unwrap();

    for round in 0..30 {
        store.enqueue(password(busy, &round.to_string())).await.unwrap();
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.stats().reaped(), 1);
    assert_eq!(store.stats().active_shards(), 1);
    assert_eq!(db.get("account", "1"), Some(json!({"password": "once"})));

    eventually("busy shard reaped", || store.stats().reaped() == 2).await;
    assert_eq!(store.stats().active_shards(), 0);
    assert_eq!(db.get("account", "2"), Some(json!({"password": "29"})));

    // A reaped shard is recreated on demand.
    store.enqueue(password(quiet, "again")).await.unwrap();
    store.flush_all().await.unwrap();
    assert_eq!(db.get("account", "1"), Some(json!({"password": "again"})));
    store.close().await;
}

#[tokio::test]
async fn close_performs_a_final_flush() {
    let (store, db) = start(config());

    store.enqueue(password(9, "last")).await.unwrap();
    store.enqueue(password(10, "words")).await.unwrap();
    store.close().await;

    assert_eq!(db.get("account", "9"), Some(json!({"password": "last"})));
    assert_eq!(db.get("account", "10"), Some(json!({"password": "words"})));
    assert!(store.is_closed());
    assert_eq!(store.stats().active_shards(), 0);
}

/// Holds every `UPSERT stalled` statement until `gate` is notified.
#[derive(Clone)]
struct GatedDatabase {
    inner: MemoryDatabase,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

struct GatedTransaction {
    inner: Box<dyn Transaction>,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait]
impl Database for GatedDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(GatedTransaction {
            inner: self.inner.begin().await?,
            entered: self.entered.clone(),
            gate: self.gate.clone(),
        }))
    }
}

#[async_trait]
impl Transaction for GatedTransaction {
    async fn exec(&mut self, statement: &str, args: &[Value]) -> Result<u64, StoreError> {
        if statement == "UPSERT stalled" {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        self.inner.exec(statement, args).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn a_stalled_shard_does_not_block_other_shards() {
    let db = MemoryDatabase::new();
    let gated = GatedDatabase {
        inner: db.clone(),
        entered: Arc::new(Notify::new()),
        gate: Arc::new(Notify::new()),
    };
    let store = WriteBehindStore::start(
        StoreConfig {
            flush_interval: Duration::from_millis(50),
            ..config()
        },
        Arc::new(gated.clone()),
    );
    let slow: ShardId = 1;
    let fast: ShardId = 2;

    store
        .enqueue(Mutation::statement(
            slow,
            DedupKey::new(1, "stalled", 1),
            "UPSERT stalled",
            vec![json!(1), json!({"slow": true})],
        ))
        .await
        .unwrap();
    timeout(Duration::from_secs(2), gated.entered.notified())
        .await
        .expect("slow shard started its flush");

    // The slow shard is parked inside its transaction from here on.
    store
        .enqueue(Mutation::statement(
            fast,
            DedupKey::new(2, "account", 2),
            "UPSERT account",
            vec![json!(2), json!({"password": "fast"})],
        ))
        .await
        .unwrap();
    eventually("the fast shard to commit", || {
        db.get("account", "2") == Some(json!({"password": "fast"}))
    })
    .await;

    timeout(
        Duration::from_secs(1),
        store.enqueue(Mutation::statement(
            slow,
            DedupKey::new(9, "account", 9),
            "UPSERT account",
            vec![json!(9), json!({"password": "later"})],
        )),
    )
    .await
    .expect("dispatcher accepts work for the stalled shard")
    .unwrap();
    eventually("the third batch to be routed", || store.stats().batches() == 3).await;
    assert_eq!(db.get("stalled", "1"), None);

    gated.gate.notify_one();
    eventually("the slow shard to catch up", || {
        db.get("stalled", "1").is_some() && db.get("account", "9").is_some()
    })
    .await;
    store.close().await;
}
