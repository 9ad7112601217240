//! Account registration and login.
//!
//! Accounts live in an in-memory directory indexed by username and by
//! login token. Every change is persisted through the write-behind store as
//! an `UPSERT account` keyed by the account id.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use game_runtime::route::params::required_str;
use game_runtime::{
    DedupKey, HandlerContext, Map, Mutation, ParamError, ResponseCode, Route, Value,
    WriteBehindStore,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub token: String,
}

impl Account {
    /// The persisted row, password included.
    fn row(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "password": self.password,
            "token": self.token,
        })
    }

    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Accounts by username, plus a token index.
pub struct AccountDirectory {
    by_name: DashMap<String, Account>,
    by_token: DashMap<String, String>,
    next_id: AtomicI64,
}

impl AccountDirectory {
    /// Ids are handed out from `first_id` upwards.
    pub fn new(first_id: i64) -> Self {
        Self {
            by_name: DashMap::new(),
            by_token: DashMap::new(),
            next_id: AtomicI64::new(first_id),
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, username: &str) -> Option<Account> {
        self.by_name.get(username).map(|a| a.value().clone())
    }

    /// Creates an account unless the username is taken.
    pub fn register(&self, username: &str, password: &str) -> Option<Account> {
        match self.by_name.entry(username.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let account = Account {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    username: username.to_string(),
                    password: password.to_string(),
                    token: new_token(),
                };
                self.by_token
                    .insert(account.token.clone(), account.username.clone());
                slot.insert(account.clone());
                Some(account)
            }
        }
    }

    /// Checks the password and issues a fresh token.
    pub fn password_login(&self, username: &str, password: &str) -> Option<Account> {
        let mut account = self.by_name.get_mut(username)?;
        if account.password != password {
            return None;
        }
        self.by_token.remove(&account.token);
        account.token = new_token();
        self.by_token
            .insert(account.token.clone(), account.username.clone());
        Some(account.value().clone())
    }

    pub fn token_login(&self, token: &str) -> Option<Account> {
        let username = self.by_token.get(token)?.value().clone();
        self.get(&username)
    }
}

async fn persist(store: &WriteBehindStore, account: &Account) -> ResponseCode {
    let mutation = Mutation::statement(
        store.shard_for(account.id),
        DedupKey::new(account.id, "account", account.id),
        "UPSERT account",
        vec![json!(account.id), account.row()],
    );
    match store.enqueue(mutation).await {
        Ok(()) => ResponseCode::SUCCESS,
        Err(e) => {
            warn!("account {} not persisted: {}", account.id, e);
            ResponseCode::DATABASE_ERROR
        }
    }
}

fn bind_session(ctx: &HandlerContext, account: &Account) {
    if let Some(connection) = ctx.connection() {
        connection.set_key_id(account.id);
    }
}

fn credentials(params: &Map<String, Value>) -> Result<(String, String), ParamError> {
    Ok((
        required_str(params, "username")?,
        required_str(params, "password")?,
    ))
}

pub struct Register {
    accounts: Arc<AccountDirectory>,
    store: Arc<WriteBehindStore>,
    username: String,
    password: String,
}

impl Register {
    pub fn new(accounts: Arc<AccountDirectory>, store: Arc<WriteBehindStore>) -> Self {
        Self {
            accounts,
            store,
            username: String::new(),
            password: String::new(),
        }
    }
}

#[async_trait]
impl Route for Register {
    fn parse(&mut self, params: &Map<String, Value>) -> Result<(), ParamError> {
        (self.username, self.password) = credentials(params)?;
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut HandlerContext) -> ResponseCode {
        let Some(account) = self.accounts.register(&self.username, &self.password) else {
            debug!("username {} already registered", self.username);
            return ResponseCode::USER_STATUS;
        };
        let code = persist(&self.store, &account).await;
        if code.is_success() {
            ctx.insert("account", account.to_json());
        }
        code
    }
}

pub struct PasswordLogin {
    accounts: Arc<AccountDirectory>,
    store: Arc<WriteBehindStore>,
    username: String,
    password: String,
}

impl PasswordLogin {
    pub fn new(accounts: Arc<AccountDirectory>, store: Arc<WriteBehindStore>) -> Self {
        Self {
            accounts,
            store,
            username: String::new(),
            password: String::new(),
        }
    }
}

#[async_trait]
impl Route for PasswordLogin {
    fn parse(&mut self, params: &Map<String, Value>) -> Result<(), ParamError> {
        (self.username, self.password) = credentials(params)?;
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut HandlerContext) -> ResponseCode {
        let Some(account) = self.accounts.password_login(&self.username, &self.password) else {
            debug!("password login rejected for {}", self.username);
            return ResponseCode::USER_STATUS;
        };
        let code = persist(&self.store, &account).await;
        if code.is_success() {
            bind_session(ctx, &account);
            ctx.insert("account", account.to_json());
        }
        code
    }
}

pub struct TokenLogin {
    accounts: Arc<AccountDirectory>,
    token: String,
}

impl TokenLogin {
    pub fn new(accounts: Arc<AccountDirectory>) -> Self {
        Self {
            accounts,
            token: String::new(),
        }
    }
}

#[async_trait]
impl Route for TokenLogin {
    fn parse(&mut self, params: &Map<String, Value>) -> Result<(), ParamError> {
        self.token = required_str(params, "token")?;
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut HandlerContext) -> ResponseCode {
        let Some(account) = self.accounts.token_login(&self.token) else {
            debug!("unknown login token");
            return ResponseCode::USER_STATUS;
        };
        bind_session(ctx, &account);
        ctx.insert("account", account.to_json());
        ResponseCode::SUCCESS
    }
}
