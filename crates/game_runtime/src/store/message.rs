//! Mutation messages routed through the write-behind store.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::database::Transaction;
use crate::error::StoreError;

pub type ShardId = u32;

/// Shard count used when the configuration leaves it unset.
pub fn default_shard_count() -> usize {
    num_cpus::get() * 10
}

/// Picks the shard for an owner id. Negative ids wrap like positive ones.
pub fn shard_for(owner: i64, shard_count: usize) -> ShardId {
    let count = shard_count.max(1) as i64;
    owner.rem_euclid(count) as ShardId
}

/// Identifies the logical row a mutation targets. Only the latest mutation
/// per key survives until the next flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey(String);

impl DedupKey {
    /// `"{owner}_{table}_{pk}"`
    pub fn new(owner: impl fmt::Display, table: &str, pk: impl fmt::Display) -> Self {
        Self(format!("{owner}_{table}_{pk}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DedupKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for DedupKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Performs a write inside an open transaction.
#[async_trait]
pub trait ApplyWrite: Send + Sync + 'static {
    async fn apply(&self, tx: &mut dyn Transaction) -> Result<(), StoreError>;
}

/// One statement with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub args: Vec<Value>,
}

impl Statement {
    pub fn new(text: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            args,
        }
    }
}

#[async_trait]
impl ApplyWrite for Statement {
    async fn apply(&self, tx: &mut dyn Transaction) -> Result<(), StoreError> {
        tx.exec(&self.text, &self.args).await.map(|_| ())
    }
}

#[async_trait]
impl ApplyWrite for Vec<Statement> {
    async fn apply(&self, tx: &mut dyn Transaction) -> Result<(), StoreError> {
        for statement in self {
            statement.apply(&mut *tx).await?;
        }
        Ok(())
    }
}

/// A pending write: which shard owns it, which row it targets, and how to
/// apply it.
#[derive(Clone)]
pub struct Mutation {
    pub shard: ShardId,
    pub key: DedupKey,
    pub write: Arc<dyn ApplyWrite>,
}

impl Mutation {
    pub fn new(shard: ShardId, key: DedupKey, write: impl ApplyWrite) -> Self {
        Self {
            shard,
            key,
            write: Arc::new(write),
        }
    }

    /// Shorthand for a mutation applying a single [`Statement`].
    pub fn statement(
        shard: ShardId,
        key: DedupKey,
        text: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self::new(shard, key, Statement::new(text, args))
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("shard", &self.shard)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_composition() {
        assert_eq!(DedupKey::new(42, "account", 42).as_str(), "42_account_42");
        assert_eq!(DedupKey::from("x").to_string(), "x");
    }

    #[test]
    fn shard_selection_is_stable_and_in_range() {
        assert_eq!(shard_for(42, 10), 2);
        assert_eq!(shard_for(42, 10), shard_for(42, 10));
        assert_eq!(shard_for(-1, 10), 9);
        assert_eq!(shard_for(7, 0), 0);
        for owner in -50..50 {
            assert!(shard_for(owner, 8) < 8);
        }
    }

    #[test]
    fn default_shard_count_scales_with_cores() {
        assert_eq!(default_shard_count() % 10, 0);
        assert!(default_shard_count() >= 10);
    }
}
