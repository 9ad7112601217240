//! Transport-generic request dispatch.
//!
//! ```text
//! frame ─► codec.unmarshal ─► Request ─► registry.resolve ─► fresh Route
//!                                                              │
//!            ┌──────────────────── StepPipeline ───────────────┘
//!            │ 1. parse(params)      panic/error ─► 300 reply, stop
//!            │ 2. run_bounded(handle) panic ─► 500 reply
//!            │                        deadline ─► timeout hook (102)
//!            └─► Reply{code, data} + attachments ─► codec.marshal ─► sink
//! ```

use std::fmt;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::{ConnectionInfo, ResponseSink};
use crate::bounded::{run_bounded, Bounded};
use crate::codec::Codec;
use crate::error::{RuntimeError, TaskError};
use crate::pipeline::StepPipeline;
use crate::route::{HandlerContext, Reply, Request, ResponseCode, Route, RouteRegistry};
use crate::supervisor::Supervisor;

/// Builds the reply sent when a handler misses its deadline.
pub type TimeoutHook = Arc<dyn Fn(u32) -> Reply + Send + Sync>;

/// Request counters for the status line.
#[derive(Debug, Default)]
pub struct DispatchStats {
    requests: AtomicU64,
    running: AtomicI64,
}

impl DispatchStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> i64 {
        self.running.load(Ordering::Relaxed)
    }
}

struct RunningGuard(Arc<DispatchStats>);

impl RunningGuard {
    fn enter(stats: &Arc<DispatchStats>) -> Self {
        stats.requests.fetch_add(1, Ordering::Relaxed);
        stats.running.fetch_add(1, Ordering::Relaxed);
        Self(stats.clone())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher<C: Codec> {
    name: Arc<str>,
    codec: Arc<C>,
    routes: Arc<RouteRegistry>,
    supervisor: Supervisor,
    deadline: Duration,
    echo_cmd: bool,
    timeout_hook: Option<TimeoutHook>,
    stats: Arc<DispatchStats>,
}

impl<C: Codec> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            codec: self.codec.clone(),
            routes: self.routes.clone(),
            supervisor: self.supervisor.clone(),
            deadline: self.deadline,
            echo_cmd: self.echo_cmd,
            timeout_hook: self.timeout_hook.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<C: Codec> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("codec", &self.codec.name())
            .field("deadline", &self.deadline)
            .field("echo_cmd", &self.echo_cmd)
            .finish()
    }
}

impl<C: Codec> Dispatcher<C> {
    /// `supervisor` owns the handler tasks; `deadline` applies to routes that
    /// don't set their own.
    pub fn new(
        name: impl Into<Arc<str>>,
        codec: C,
        routes: Arc<RouteRegistry>,
        supervisor: Supervisor,
        deadline: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            codec: Arc::new(codec),
            routes,
            supervisor,
            deadline,
            echo_cmd: false,
            timeout_hook: None,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Echo the request's `cmd` in every reply (socket transport).
    pub fn with_cmd_echo(mut self, echo: bool) -> Self {
        self.echo_cmd = echo;
        self
    }

    pub fn with_timeout_hook(mut self, hook: TimeoutHook) -> Self {
        self.timeout_hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Decodes one frame and resolves a fresh route for it.
    pub fn decode(&self, frame: &[u8]) -> Result<(Request, Box<dyn Route>), RuntimeError> {
        let value = self.codec.unmarshal(frame)?;
        let request = Request::from_value(value)?;
        let route = self.routes.resolve(request.cmd)?;
        Ok((request, route))
    }

    /// Decodes, resolves and executes one frame.
    ///
    /// Decode and resolve failures are returned to the transport, which
    /// decides between rejecting the request and dropping the connection.
    pub async fn dispatch(
        &self,
        frame: &[u8],
        sink: &ResponseSink,
        connection: Option<Arc<ConnectionInfo>>,
    ) -> Result<bool, RuntimeError> {
        let (request, route) = self.decode(frame)?;
        Ok(self.execute(request, route, sink.clone(), connection).await)
    }

    /// Runs the parse and handle steps for an already resolved request.
    ///
    /// Returns `true` when the handler completed within its deadline.
    pub async fn execute(
        &self,
        request: Request,
        route: Box<dyn Route>,
        sink: ResponseSink,
        connection: Option<Arc<ConnectionInfo>>,
    ) -> bool {
        let _running = RunningGuard::enter(&self.stats);
        let Request { cmd, params } = request;
        debug!("{} request cmd {} params {:?}", self.name, cmd, params);

        let parse = {
            let this = self.clone();
            let sink = sink.clone();
            move |route: Box<dyn Route>| async move { this.parse_step(cmd, route, params, &sink) }
        };
        let handle = {
            let this = self.clone();
            move |route: Box<dyn Route>| async move {
                this.handle_step(cmd, route, connection, &sink).await
            }
        };

        StepPipeline::new()
            .step(parse)
            .step(handle)
            .run(route)
            .await
            .is_some()
    }

    fn parse_step(
        &self,
        cmd: u32,
        mut route: Box<dyn Route>,
        params: Map<String, Value>,
        sink: &ResponseSink,
    ) -> ControlFlow<(), Box<dyn Route>> {
        let failure = match catch_unwind(AssertUnwindSafe(|| route.parse(&params))) {
            Ok(Ok(())) => return ControlFlow::Continue(route),
            Ok(Err(err)) => err.to_string(),
            Err(payload) => TaskError::from_panic(payload).to_string(),
        };
        warn!("{} cmd {} rejected parameters: {}", self.name, cmd, failure);
        self.send_reply(sink, &self.reply(cmd, ResponseCode::PARAM_ERROR));
        ControlFlow::Break(())
    }

    async fn handle_step(
        &self,
        cmd: u32,
        mut route: Box<dyn Route>,
        connection: Option<Arc<ConnectionInfo>>,
        sink: &ResponseSink,
    ) -> ControlFlow<(), Box<dyn Route>> {
        let deadline = route.deadline().unwrap_or(self.deadline);
        let work = async move {
            let mut ctx = HandlerContext::new(cmd, connection);
            let code = route.handle(&mut ctx).await;
            (route, code, ctx)
        };
        let on_timeout = || {
            warn!("{} cmd {} exceeded its {:?} deadline", self.name, cmd, deadline);
            let reply = match &self.timeout_hook {
                Some(hook) => hook(cmd),
                None => self.reply(cmd, ResponseCode::TIMEOUT),
            };
            self.send_reply(sink, &reply);
        };

        match run_bounded(&self.supervisor, work, deadline, on_timeout).await {
            Bounded::Completed(Ok((route, code, ctx))) => {
                if code != ResponseCode::NO_REPLY {
                    let mut reply = self.reply(cmd, code).with_data(ctx.data);
                    reply.merge_attachments(&ctx.attachments);
                    self.send_reply(sink, &reply);
                }
                ControlFlow::Continue(route)
            }
            Bounded::Completed(Err(err)) => {
                error!("{} cmd {} handler failed: {}", self.name, cmd, err);
                self.send_reply(sink, &self.reply(cmd, ResponseCode::LOGIC_ERROR));
                ControlFlow::Break(())
            }
            Bounded::TimedOut => ControlFlow::Break(()),
        }
    }

    /// A reply carrying only `code`, with `cmd` echoed when configured.
    pub fn reply(&self, cmd: u32, code: ResponseCode) -> Reply {
        Reply::new(self.echo_cmd.then_some(cmd), code)
    }

    /// Encodes `reply` and queues it on `sink`.
    pub fn send_reply(&self, sink: &ResponseSink, reply: &Reply) {
        match self.codec.marshal(reply) {
            Ok(frame) => {
                if !sink.send(frame) {
                    debug!("{} connection gone, reply {} dropped", self.name, reply.code);
                }
            }
            Err(e) => error!("{} failed to encode reply: {}", self.name, e),
        }
    }

    /// The structured rejection for a decode or resolve failure, if the
    /// error has one.
    pub fn rejection(err: &RuntimeError) -> Option<Reply> {
        match err {
            RuntimeError::Codec(_) => Some(Reply::new(None, ResponseCode::PARAM_ERROR)),
            RuntimeError::RouteNotFound(_) => Some(Reply::new(None, ResponseCode::NOT_FOUND)),
            _ => None,
        }
    }
}
