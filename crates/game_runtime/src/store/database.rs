//! Persistence collaborator interface and an in-memory implementation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::StoreError;

/// A source of transactions. Shards share one instance and run their
/// transactions against it concurrently.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

#[async_trait]
pub trait Transaction: Send {
    /// Executes one statement, returning the number of affected rows.
    async fn exec(&mut self, statement: &str, args: &[Value]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Upsert { table: String, key: String, row: Value },
    Delete { table: String, key: String },
}

#[derive(Default)]
struct MemoryInner {
    rows: DashMap<(String, String), Value>,
    journal: Mutex<Vec<String>>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    fail_next_commit: AtomicBool,
}

/// Table/key/row store understanding two statements:
///
/// * `UPSERT <table>` with args `[key, row]`
/// * `DELETE <table>` with args `[key]`
///
/// Writes are staged per transaction and become visible on commit.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<MemoryInner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.inner
            .rows
            .get(&(table.to_string(), key.to_string()))
            .map(|row| row.value().clone())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .rows
            .iter()
            .filter(|entry| entry.key().0 == table)
            .count()
    }

    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::Acquire)
    }

    pub fn rollbacks(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::Acquire)
    }

    /// Statements of every committed transaction, in commit order.
    pub fn journal(&self) -> Vec<String> {
        self.inner
            .journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    /// Makes the next commit fail and discard its writes.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            db: self.inner.clone(),
            staged: Vec::new(),
            statements: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    db: Arc<MemoryInner>,
    staged: Vec<Op>,
    statements: Vec<String>,
}

fn key_arg(statement: &str, args: &[Value]) -> Result<String, StoreError> {
    match args.first() {
        Some(Value::String(key)) => Ok(key.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(StoreError::Exec {
            statement: statement.to_string(),
            reason: "first argument must be a string or numeric key".into(),
        }),
    }
}

fn parse(statement: &str, args: &[Value]) -> Result<Op, StoreError> {
    let mut words = statement.split_whitespace();
    let verb = words.next().map(str::to_ascii_uppercase);
    let table = words.next().map(str::to_string);
    let unknown = || StoreError::Exec {
        statement: statement.to_string(),
        reason: "expected `UPSERT <table>` or `DELETE <table>`".into(),
    };
    let (Some(verb), Some(table), None) = (verb, table, words.next()) else {
        return Err(unknown());
    };

    match verb.as_str() {
        "UPSERT" => {
            let key = key_arg(statement, args)?;
            let row = args.get(1).cloned().ok_or_else(|| StoreError::Exec {
                statement: statement.to_string(),
                reason: "missing row argument".into(),
            })?;
            Ok(Op::Upsert { table, key, row })
        }
        "DELETE" => Ok(Op::Delete {
            key: key_arg(statement, args)?,
            table,
        }),
        _ => Err(unknown()),
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn exec(&mut self, statement: &str, args: &[Value]) -> Result<u64, StoreError> {
        let op = parse(statement, args)?;
        self.staged.push(op);
        self.statements.push(statement.to_string());
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            db,
            staged,
            statements,
        } = *self;
        if db.fail_next_commit.swap(false, Ordering::AcqRel) {
            db.rollbacks.fetch_add(1, Ordering::AcqRel);
            return Err(StoreError::Commit("injected commit failure".into()));
        }
        for op in staged {
            match op {
                Op::Upsert { table, key, row } => {
                    db.rows.insert((table, key), row);
                }
                Op::Delete { table, key } => {
                    db.rows.remove(&(table, key));
                }
            }
        }
        if let Ok(mut journal) = db.journal.lock() {
            journal.extend(statements);
        }
        db.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.db.rollbacks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
