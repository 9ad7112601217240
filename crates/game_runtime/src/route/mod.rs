//! Command routing.
//!
//! Business handlers implement [`Route`] and are registered under a numeric
//! command code. The registry stores a factory per code, never an instance,
//! so every request gets a fresh handler value:
//!
//! ```text
//! body {"cmd": 1002, "params": {..}}
//!        │
//!        ▼
//! RouteRegistry::resolve(1002) ──► factory() ──► Box<dyn Route> (new value)
//!                                                   │ parse(params)
//!                                                   │ handle(ctx) ─► ResponseCode
//! ```

mod attachments;
mod code;
pub mod params;

pub use attachments::{Attachments, SyncRule};
pub use code::ResponseCode;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::connection::ConnectionInfo;
use crate::error::{CodecError, ParamError, RuntimeError};

/// A decoded request body.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub cmd: u32,
    pub params: Map<String, Value>,
}

impl Request {
    /// Extracts `cmd` and `params` from a decoded body.
    ///
    /// `cmd` may be a JSON number or a numeric string. A missing or
    /// non-object `params` field yields empty parameters.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let Value::Object(mut body) = value else {
            return Err(CodecError::NotAnObject);
        };
        let cmd = body
            .get("cmd")
            .and_then(command_code)
            .ok_or(CodecError::MissingCommand)?;
        let params = match body.remove("params") {
            Some(Value::Object(params)) => params,
            _ => Map::new(),
        };
        Ok(Self { cmd, params })
    }
}

fn command_code(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Per-request state handed to [`Route::handle`].
pub struct HandlerContext {
    cmd: u32,
    connection: Option<Arc<ConnectionInfo>>,
    /// Response `data` payload.
    pub data: Map<String, Value>,
    /// Side-channel sections merged into the reply.
    pub attachments: Attachments,
}

impl HandlerContext {
    pub fn new(cmd: u32, connection: Option<Arc<ConnectionInfo>>) -> Self {
        Self {
            cmd,
            connection,
            data: Map::new(),
            attachments: Attachments::default(),
        }
    }

    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    /// The socket session the request arrived on. `None` for HTTP.
    pub fn connection(&self) -> Option<&Arc<ConnectionInfo>> {
        self.connection.as_ref()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("cmd", &self.cmd)
            .field("connection", &self.connection.as_ref().map(|c| c.id()))
            .field("data", &self.data)
            .finish()
    }
}

/// A business handler bound to one command code.
#[async_trait]
pub trait Route: Send + 'static {
    /// Validates and stores the request parameters.
    fn parse(&mut self, params: &Map<String, Value>) -> Result<(), ParamError>;

    /// Runs the business logic.
    async fn handle(&mut self, ctx: &mut HandlerContext) -> ResponseCode;

    /// Overrides the transport's handler deadline for this route.
    fn deadline(&self) -> Option<Duration> {
        None
    }
}

type RouteFactory = Arc<dyn Fn() -> Box<dyn Route> + Send + Sync>;

/// Command code to route factory mapping.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct RouteRegistry {
    routes: HashMap<u32, RouteFactory>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `cmd`, replacing any previous one.
    pub fn register<R, F>(&mut self, cmd: u32, factory: F) -> &mut Self
    where
        R: Route,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.routes
            .insert(cmd, Arc::new(move || Box::new(factory()) as Box<dyn Route>));
        self
    }

    /// Registers `R::default` as the factory for `cmd`.
    pub fn register_default<R: Route + Default>(&mut self, cmd: u32) -> &mut Self {
        self.register(cmd, R::default)
    }

    /// Builds a fresh handler for `cmd`.
    pub fn resolve(&self, cmd: u32) -> Result<Box<dyn Route>, RuntimeError> {
        self.routes
            .get(&cmd)
            .map(|factory| factory())
            .ok_or(RuntimeError::RouteNotFound(cmd))
    }

    pub fn contains(&self, cmd: u32) -> bool {
        self.routes.contains_key(&cmd)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered command codes, ascending.
    pub fn commands(&self) -> Vec<u32> {
        let mut cmds: Vec<u32> = self.routes.keys().copied().collect();
        cmds.sort_unstable();
        cmds
    }
}

impl fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("commands", &self.commands())
            .finish()
    }
}

/// Response body shared by both transports.
///
/// Socket replies echo `cmd`; HTTP replies leave it out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<u32>,
    pub code: ResponseCode,
    pub data: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reply {
    pub fn new(cmd: Option<u32>, code: ResponseCode) -> Self {
        Self {
            cmd,
            code,
            data: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Merges attachment sections without overwriting anything already set.
    ///
    /// Attachment `data` entries go into the reply's `data` object; every
    /// other section lands at the top level.
    pub fn merge_attachments(&mut self, attachments: &Attachments) {
        for (key, value) in attachments.to_json_map() {
            if key == "cmd" || key == "code" {
                continue;
            }
            if key == "data" {
                if let Value::Object(entries) = value {
                    for (k, v) in entries {
                        self.data.entry(k).or_insert(v);
                    }
                }
                continue;
            }
            self.extra.entry(key).or_insert(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Counter {
        hits: u32,
    }

    #[async_trait]
    impl Route for Counter {
        fn parse(&mut self, _params: &Map<String, Value>) -> Result<(), ParamError> {
            Ok(())
        }

        async fn handle(&mut self, ctx: &mut HandlerContext) -> ResponseCode {
            self.hits += 1;
            ctx.insert("hits", self.hits);
            ResponseCode::SUCCESS
        }
    }

    #[test]
    fn request_accepts_numeric_and_string_commands() {
        let req = Request::from_value(json!({"cmd": 7, "params": {"a": 1}})).unwrap();
        assert_eq!(req.cmd, 7);
        assert_eq!(req.params.get("a"), Some(&json!(1)));

        let req = Request::from_value(json!({"cmd": " 1002 "})).unwrap();
        assert_eq!(req.cmd, 1002);
        assert!(req.params.is_empty());
    }

    #[test]
    fn request_rejects_bad_bodies() {
        assert!(matches!(
            Request::from_value(json!([1, 2])),
            Err(CodecError::NotAnObject)
        ));
        assert!(matches!(
            Request::from_value(json!({"params": {}})),
            Err(CodecError::MissingCommand)
        ));
        assert!(matches!(
            Request::from_value(json!({"cmd": -3})),
            Err(CodecError::MissingCommand)
        ));
        assert!(matches!(
            Request::from_value(json!({"cmd": "login"})),
            Err(CodecError::MissingCommand)
        ));
    }

    #[tokio::test]
    async fn every_resolve_builds_a_fresh_route() {
        let mut registry = RouteRegistry::new();
        registry.register_default::<Counter>(1);

        for _ in 0..3 {
            let mut route = registry.resolve(1).unwrap();
            let mut ctx = HandlerContext::new(1, None);
            assert_eq!(route.handle(&mut ctx).await, ResponseCode::SUCCESS);
            assert_eq!(ctx.data.get("hits"), Some(&json!(1)));
        }
    }

    #[test]
    fn unknown_command_is_route_not_found() {
        let registry = RouteRegistry::new();
        assert!(matches!(
            registry.resolve(99),
            Err(RuntimeError::RouteNotFound(99))
        ));
    }

    #[test]
    fn registry_lists_commands_in_order() {
        let mut registry = RouteRegistry::new();
        registry
            .register_default::<Counter>(30)
            .register_default::<Counter>(4)
            .register(12, Counter::default);
        assert_eq!(registry.commands(), vec![4, 12, 30]);
        assert!(registry.contains(12));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn reply_keeps_existing_keys_when_merging() {
        let mut attachments = Attachments::default();
        attachments.data("gold", json!(10));
        attachments.data("level", json!(99));
        attachments.modify(
            &SyncRule::new("hero").with_primary_key("id"),
            [json!({"id": 3, "hp": 40})],
        );

        let mut data = Map::new();
        data.insert("level".into(), json!(2));
        let mut reply = Reply::new(Some(5), ResponseCode::SUCCESS).with_data(data);
        reply.merge_attachments(&attachments);

        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "cmd": 5,
                "code": 200,
                "data": {"level": 2, "gold": 10},
                "mod": {"hero": {"3": {"id": 3, "hp": 40}}}
            })
        );
    }

    #[test]
    fn http_reply_omits_cmd() {
        let reply = Reply::new(None, ResponseCode::NOT_FOUND);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"code": 404, "data": {}})
        );
    }
}
