//! Business routes served on both transports.

mod account;
mod ping;

pub use account::{AccountDirectory, PasswordLogin, Register, TokenLogin};
pub use ping::Ping;

use std::sync::Arc;

use game_runtime::{RouteRegistry, WriteBehindStore};

pub const PING: u32 = 1;
pub const ACCOUNT_REGISTER: u32 = 1001;
pub const ACCOUNT_PASSWORD_LOGIN: u32 = 1002;
pub const ACCOUNT_TOKEN_LOGIN: u32 = 1003;

/// Builds the registry for every command the gate serves.
pub fn registry(accounts: Arc<AccountDirectory>, store: Arc<WriteBehindStore>) -> RouteRegistry {
    let mut routes = RouteRegistry::new();
    routes.register_default::<Ping>(PING);
    {
        let (accounts, store) = (accounts.clone(), store.clone());
        routes.register(ACCOUNT_REGISTER, move || {
            Register::new(accounts.clone(), store.clone())
        });
    }
    {
        let (accounts, store) = (accounts.clone(), store);
        routes.register(ACCOUNT_PASSWORD_LOGIN, move || {
            PasswordLogin::new(accounts.clone(), store.clone())
        });
    }
    routes.register(ACCOUNT_TOKEN_LOGIN, move || TokenLogin::new(accounts.clone()));
    routes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use game_runtime::{
        json, Dispatcher, HttpCodec, MemoryDatabase, ResponseSink, StoreConfig, Supervisor, Value,
    };

    struct Gate {
        dispatcher: Dispatcher<HttpCodec>,
        store: Arc<WriteBehindStore>,
        db: MemoryDatabase,
    }

    fn gate() -> Gate {
        let db = MemoryDatabase::new();
        let store = Arc::new(WriteBehindStore::start(
            StoreConfig {
                shard_count: 4,
                flush_interval: Duration::from_secs(60),
                ..StoreConfig::default()
            },
            Arc::new(db.clone()),
        ));
        let routes = registry(Arc::new(AccountDirectory::new(1)), store.clone());
        let dispatcher = Dispatcher::new(
            "Http",
            HttpCodec::new(),
            Arc::new(routes),
            Supervisor::new("routes-test"),
            Duration::from_secs(1),
        );
        Gate {
            dispatcher,
            store,
            db,
        }
    }

    async fn call(gate: &Gate, body: Value) -> Value {
        let (sink, mut replies) = ResponseSink::channel();
        let frame = serde_json::to_vec(&body).unwrap();
        gate.dispatcher.dispatch(&frame, &sink, None).await.unwrap();
        serde_json::from_slice(&replies.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn ping_answers() {
        let gate = gate();
        let reply = call(&gate, json!({"cmd": PING})).await;
        assert_eq!(reply["code"], 200);
        assert_eq!(reply["data"]["pong"], true);
    }

    #[tokio::test]
    async fn register_then_log_in_both_ways() {
        let gate = gate();
        let credentials = json!({"username": "ana", "password": "pw"});

        let reply = call(&gate, json!({"cmd": ACCOUNT_REGISTER, "params": credentials.clone()})).await;
        assert_eq!(reply["code"], 200);
        assert_eq!(reply["data"]["account"]["id"], 1);

        let again = call(&gate, json!({"cmd": ACCOUNT_REGISTER, "params": credentials.clone()})).await;
        assert_eq!(again["code"], 201);

        let wrong = call(
            &gate,
            json!({"cmd": ACCOUNT_PASSWORD_LOGIN, "params": {"username": "ana", "password": "x"}}),
        )
        .await;
        assert_eq!(wrong["code"], 201);

        let login = call(&gate, json!({"cmd": ACCOUNT_PASSWORD_LOGIN, "params": credentials.clone()})).await;
        assert_eq!(login["code"], 200);
        let token = login["data"]["account"]["token"].as_str().unwrap().to_string();
        assert_ne!(Value::from(token.clone()), reply["data"]["account"]["token"]);

        let by_token = call(
            &gate,
            json!({"cmd": ACCOUNT_TOKEN_LOGIN, "params": {"token": token.clone()}}),
        )
        .await;
        assert_eq!(by_token["code"], 200);
        assert_eq!(by_token["data"]["account"]["username"], "ana");

        // Register and login wrote the same row; only the latest survives.
        gate.store.flush_all().await.unwrap();
        let row = gate.db.get("account", "1").unwrap();
        assert_eq!(row["token"], Value::from(token));
        assert_eq!(row["password"], "pw");
        assert_eq!(gate.db.commits(), 1);
        gate.store.close().await;
    }

    #[tokio::test]
    async fn missing_credentials_are_param_errors() {
        let gate = gate();
        let reply = call(&gate, json!({"cmd": ACCOUNT_REGISTER, "params": {"username": "ana"}})).await;
        assert_eq!(reply["code"], 300);
        let reply = call(&gate, json!({"cmd": ACCOUNT_TOKEN_LOGIN})).await;
        assert_eq!(reply["code"], 300);
    }
}
