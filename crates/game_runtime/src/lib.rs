//! # Game Runtime
//!
//! Infrastructure for a request/reply game service: supervised tasks,
//! bounded handler execution, two transports sharing one route table, and
//! sharded write-behind persistence.
//!
//! ## Architecture Overview
//!
//! * **Supervisor** - hierarchical task scopes with panic containment and
//!   cooperative cancellation ([`supervisor`])
//! * **Bounded execution** - races a handler against its deadline without
//!   cancelling it ([`bounded`])
//! * **Step pipeline** - ordered async steps that can stop early
//!   ([`pipeline`])
//! * **Connections** - length-prefixed WebSocket sessions and JSON-over-HTTP
//!   requests, both dispatched through [`connection::Dispatcher`]
//! * **Write-behind store** - coalescing, sharded batching of persistence
//!   writes ([`store`])
//!
//! ### Message Flow
//!
//! 1. A transport accumulates bytes until a complete frame is available
//! 2. The codec decodes `{cmd, params}` and the registry builds a fresh route
//! 3. The route parses its parameters, then handles the request under a
//!    deadline
//! 4. The reply `{cmd?, code, data}` is encoded and written back
//!
//! Handlers that persist state submit [`store::Mutation`]s instead of writing
//! to the database inline.
//!
//! ## Error Handling
//!
//! Every layer reports through the enums in [`error`]. Only
//! [`RuntimeError::Network`](error::RuntimeError::Network) is fatal; every
//! other failure stays inside the request, session or shard it came from.

pub mod bounded;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod route;
pub mod server;
pub mod status;
pub mod store;
pub mod supervisor;

pub use bounded::{run_bounded, Bounded};
pub use codec::{Codec, FrameStatus, HttpCodec, SocketCodec};
pub use config::{HttpConfig, RuntimeConfig, SocketConfig};
pub use connection::{
    ConnectionId, ConnectionInfo, Dispatcher, HttpGateway, OnlineHook, ResponseSink, SocketGateway,
    TimeoutHook,
};
pub use error::{CodecError, ParamError, RuntimeError, StoreError, TaskError};
pub use pipeline::StepPipeline;
pub use route::{
    Attachments, HandlerContext, Reply, Request, ResponseCode, Route, RouteRegistry, SyncRule,
};
pub use server::{BoundListeners, GameServer};
pub use status::StatusReport;
pub use store::{
    Database, DedupKey, MemoryDatabase, Mutation, Statement, StoreConfig, Transaction,
    WriteBehindStore,
};
pub use supervisor::{CancelHandle, Supervisor, TaskHooks, TaskOutcome};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use serde_json::{json, Map, Value};
