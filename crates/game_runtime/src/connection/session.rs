//! Long-lived socket sessions.
//!
//! Every accepted WebSocket gets a sub-supervisor with three parts:
//!
//! ```text
//!            ┌──────────── session supervisor ─────────────┐
//! ws read ──►│ read loop ─ frames ─► Dispatcher::execute   │
//!            │    │ pulse(Alive/Closed)                     │
//!            │    ▼                                         │
//!            │ liveness monitor (idle timer) ── cancel ───► │
//!            │ writer  ◄── ResponseSink ◄── replies         │
//!            └─────────────────────────────────────────────┘
//! ```
//!
//! The idle timer is reset by every successfully decoded frame. When it
//! fires, or the peer goes away, the session scope is cancelled, which stops
//! the read loop, the writer and the monitor together. Handler tasks belong to
//! the gateway's supervisor, so a slow handler never holds a session open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionId, ConnectionInfo, Dispatcher, ResponseSink, TimeoutHook};
use crate::codec::{Codec, FrameStatus, SocketCodec};
use crate::error::{CodecError, RuntimeError};
use crate::status::StatusReport;
use crate::supervisor::Supervisor;

/// How long a closing session keeps writing queued frames.
const WRITE_GRACE: Duration = Duration::from_secs(1);

/// Runs when a session opens, before its first frame is read.
pub type OnlineHook = Arc<dyn Fn(&Arc<ConnectionInfo>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pulse {
    Alive,
    Closed,
}

struct Session {
    info: Arc<ConnectionInfo>,
    sink: ResponseSink,
}

#[derive(Clone)]
pub struct SocketGateway {
    dispatcher: Dispatcher<SocketCodec>,
    idle_timeout: Duration,
    online_hook: Option<OnlineHook>,
    sessions: Arc<DashMap<ConnectionId, Session>>,
    online: Arc<AtomicUsize>,
}

impl SocketGateway {
    pub fn new(dispatcher: Dispatcher<SocketCodec>, idle_timeout: Duration) -> Self {
        Self {
            dispatcher,
            idle_timeout,
            online_hook: None,
            sessions: Arc::new(DashMap::new()),
            online: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_online_hook(mut self, hook: OnlineHook) -> Self {
        self.online_hook = Some(hook);
        self
    }

    pub fn with_timeout_hook(mut self, hook: TimeoutHook) -> Self {
        self.dispatcher = self.dispatcher.with_timeout_hook(hook);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<SocketCodec> {
        &self.dispatcher
    }

    pub fn online(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionInfo>> {
        self.sessions.get(&id).map(|s| s.info.clone())
    }

    /// Pushes a server-initiated message to one session.
    pub fn send_to<T: Serialize + ?Sized>(&self, id: ConnectionId, value: &T) -> Result<bool, CodecError> {
        let frame = self.dispatcher.codec().marshal(value)?;
        Ok(self
            .sessions
            .get(&id)
            .map(|s| s.sink.send(frame))
            .unwrap_or(false))
    }

    /// Performs the WebSocket handshake on `stream` and runs the session.
    ///
    /// The handshake must finish within the idle timeout and is abandoned
    /// when the gateway shuts down.
    pub async fn accept<S>(&self, stream: S, remote_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let token = self.dispatcher.supervisor().token();
        let handshake = timeout(self.idle_timeout, tokio_tungstenite::accept_async(stream));
        let ws = tokio::select! {
            _ = token.cancelled() => {
                debug!("Handshake with {} abandoned on shutdown", remote_addr);
                return;
            }
            result = handshake => match result {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    warn!("WebSocket handshake failed for {}: {}", remote_addr, e);
                    return;
                }
                Err(_) => {
                    warn!(
                        "WebSocket handshake from {} timed out after {:?}",
                        remote_addr, self.idle_timeout
                    );
                    return;
                }
            },
        };
        self.run_session(ws, remote_addr).await
    }

    /// Runs one session until the peer leaves, the idle timer fires, a
    /// protocol error occurs, or the gateway is shut down.
    pub async fn run_session<S>(&self, ws: WebSocketStream<S>, remote_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let info = Arc::new(ConnectionInfo::new(remote_addr));
        let (sink, mut outbound) = ResponseSink::channel();
        self.online.fetch_add(1, Ordering::AcqRel);
        self.sessions.insert(
            info.id(),
            Session {
                info: info.clone(),
                sink: sink.clone(),
            },
        );
        info!("Connection {} established from {}", info.id(), remote_addr);

        if let Some(hook) = &self.online_hook {
            hook(&info);
        }

        let scope = self
            .dispatcher
            .supervisor()
            .child(format!("session-{}", info.id()));
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (pulse_tx, pulse_rx) = mpsc::channel::<Pulse>(8);

        scope.spawn(move |token| async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = outbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let sent = tokio::select! {
                    _ = token.cancelled() => break,
                    sent = ws_tx.send(Message::binary(frame)) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }

            // A peer that stopped reading gets a bounded grace period.
            let farewell = async {
                while let Ok(frame) = outbound.try_recv() {
                    if ws_tx.feed(Message::binary(frame)).await.is_err() {
                        return;
                    }
                }
                let _ = ws_tx.close().await;
            };
            if timeout(WRITE_GRACE, farewell).await.is_err() {
                debug!("Writer grace period elapsed, remaining frames dropped");
            }
        });

        scope.spawn({
            let scope = scope.clone();
            let idle = self.idle_timeout;
            let id = info.id();
            move |token| liveness(scope, token, pulse_rx, idle, id)
        });

        let token = scope.token();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = ws_rx.next() => message,
            };
            match message {
                Some(Ok(Message::Binary(bytes))) => buffer.extend_from_slice(&bytes),
                Some(Ok(Message::Text(text))) => buffer.extend_from_slice(text.as_bytes()),
                Some(Ok(Message::Close(_))) | None => {
                    let _ = pulse_tx.try_send(Pulse::Closed);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("Connection {} read error: {}", info.id(), e);
                    break;
                }
            }

            let drained = tokio::select! {
                _ = token.cancelled() => break,
                drained = self.drain(&mut buffer, &sink, &info, &pulse_tx) => drained,
            };
            if let Err(e) = drained {
                warn!("Connection {} dropped: {}", info.id(), e);
                break;
            }
        }

        scope.close_and_wait().await;
        self.sessions.remove(&info.id());
        info.fire_close();
        self.online.fetch_sub(1, Ordering::AcqRel);
        info!("Connection {} closed", info.id());
    }

    /// Dispatches every complete frame at the front of `buffer`.
    async fn drain(
        &self,
        buffer: &mut Vec<u8>,
        sink: &ResponseSink,
        info: &Arc<ConnectionInfo>,
        pulse: &mpsc::Sender<Pulse>,
    ) -> Result<(), RuntimeError> {
        loop {
            let len = match self.dispatcher.codec().frame_length(buffer)? {
                FrameStatus::Complete(len) => len,
                FrameStatus::Partial(_) => return Ok(()),
            };
            let frame: Vec<u8> = buffer.drain(..len).collect();
            let (request, route) = self.dispatcher.decode(&frame)?;
            let _ = pulse.try_send(Pulse::Alive);
            self.dispatcher
                .execute(request, route, sink.clone(), Some(info.clone()))
                .await;
        }
    }
}

async fn liveness(
    scope: Supervisor,
    token: CancellationToken,
    mut pulses: mpsc::Receiver<Pulse>,
    idle: Duration,
    id: ConnectionId,
) {
    let timer = tokio::time::sleep(idle);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = &mut timer => {
                info!("Connection {} idle for {:?}, closing", id, idle);
                break;
            }
            pulse = pulses.recv() => match pulse {
                Some(Pulse::Alive) => timer.as_mut().reset(Instant::now() + idle),
                Some(Pulse::Closed) | None => break,
            },
        }
    }
    scope.cancel();
}

impl StatusReport for SocketGateway {
    fn status_line(&self) -> String {
        let stats = self.dispatcher.stats();
        format!(
            "{}: {}/{}/{} (online/running/requests)",
            self.dispatcher.name(),
            self.online(),
            stats.running(),
            stats.requests()
        )
    }
}
