//! Connection handling for both transports.
//!
//! [`Dispatcher`] owns the decode, resolve, parse and bounded-handle path and
//! is shared by [`HttpGateway`] (one request per call) and [`SocketGateway`]
//! (framed requests over a long-lived WebSocket session).

mod client;
mod dispatcher;
mod http;
mod response;
mod session;

pub use client::{ConnectionId, ConnectionInfo, UNBOUND_KEY_ID};
pub use dispatcher::{DispatchStats, Dispatcher, TimeoutHook};
pub use http::HttpGateway;
pub use response::ResponseSink;
pub use session::{OnlineHook, SocketGateway};
