//! Core game server implementation.
//!
//! `GameServer` wires the route registry, both gateways and the write-behind
//! store under one root supervisor, binds the listeners and runs the accept
//! loops until shutdown is requested.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::codec::{HttpCodec, SocketCodec};
use crate::config::{RuntimeConfig, SocketConfig};
use crate::connection::{Dispatcher, HttpGateway, OnlineHook, SocketGateway, TimeoutHook};
use crate::error::RuntimeError;
use crate::route::RouteRegistry;
use crate::status::{render, StatusReport};
use crate::store::WriteBehindStore;
use crate::supervisor::Supervisor;

/// Listeners bound by [`GameServer::bind`], not yet serving.
#[derive(Debug)]
pub struct BoundListeners {
    http: TcpListener,
    socket: Vec<TcpListener>,
}

impl BoundListeners {
    pub fn http_addr(&self) -> Result<SocketAddr, RuntimeError> {
        self.http
            .local_addr()
            .map_err(|e| RuntimeError::Network(e.to_string()))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, RuntimeError> {
        self.socket
            .first()
            .ok_or_else(|| RuntimeError::Network("no socket listener bound".into()))?
            .local_addr()
            .map_err(|e| RuntimeError::Network(e.to_string()))
    }
}

pub struct GameServer {
    config: RuntimeConfig,
    supervisor: Supervisor,
    http: HttpGateway,
    socket: SocketGateway,
    store: Arc<WriteBehindStore>,
}

impl GameServer {
    /// Builds both gateways over `routes`. Handlers reach persistence through
    /// `store`, which the server closes last on shutdown.
    pub fn new(config: RuntimeConfig, routes: RouteRegistry, store: Arc<WriteBehindStore>) -> Self {
        let supervisor = Supervisor::new("game-server");
        let routes = Arc::new(routes);

        let http = HttpGateway::new(Dispatcher::new(
            "Http",
            HttpCodec::new(),
            routes.clone(),
            supervisor.child("http"),
            config.http.handler_timeout,
        ));
        let socket = SocketGateway::new(
            Dispatcher::new(
                "Socket",
                SocketCodec::new(),
                routes,
                supervisor.child("socket"),
                config.socket.handler_timeout,
            )
            .with_cmd_echo(true),
            config.socket.idle_timeout,
        );

        Self {
            config,
            supervisor,
            http,
            socket,
            store,
        }
    }

    pub fn with_online_hook(mut self, hook: OnlineHook) -> Self {
        self.socket = self.socket.with_online_hook(hook);
        self
    }

    /// Replaces the timeout reply of both transports.
    pub fn with_timeout_hook(mut self, hook: TimeoutHook) -> Self {
        self.http = self.http.with_timeout_hook(hook.clone());
        self.socket = self.socket.with_timeout_hook(hook);
        self
    }

    pub fn http(&self) -> &HttpGateway {
        &self.http
    }

    pub fn socket(&self) -> &SocketGateway {
        &self.socket
    }

    pub fn store(&self) -> &Arc<WriteBehindStore> {
        &self.store
    }

    /// Requests shutdown. [`serve`](Self::serve) returns once everything is
    /// drained.
    pub fn shutdown(&self) {
        self.supervisor.cancel();
    }

    pub fn status_line(&self) -> String {
        render(&self.reporters())
    }

    fn reporters(&self) -> Vec<Arc<dyn StatusReport>> {
        let http: Arc<dyn StatusReport> = Arc::new(self.http.clone());
        let socket: Arc<dyn StatusReport> = Arc::new(self.socket.clone());
        let store: Arc<dyn StatusReport> = self.store.clone();
        vec![http, socket, store]
    }

    /// Binds and serves until shutdown.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Binds the HTTP listener and the socket listener(s). Any failure here
    /// is fatal.
    pub async fn bind(&self) -> Result<BoundListeners, RuntimeError> {
        let http = TcpListener::bind(self.config.http.bind_address)
            .await
            .map_err(|e| RuntimeError::Network(format!("HTTP bind failed: {e}")))?;
        info!("✅ Http listening on {}", self.config.http.bind_address);

        let core_count = num_cpus::get();
        let acceptors = if self.config.socket.use_reuse_port {
            core_count
        } else {
            1
        };
        info!(
            "🧠 Detected {} CPU cores, using {} socket acceptor(s)",
            core_count, acceptors
        );

        let mut socket = Vec::with_capacity(acceptors);
        for i in 0..acceptors {
            let listener = socket_listener(&self.config.socket)?;
            info!("✅ Socket listener {} bound on {}", i, self.config.socket.bind_address);
            socket.push(listener);
        }
        Ok(BoundListeners { http, socket })
    }

    /// Serves on already bound listeners until [`shutdown`](Self::shutdown)
    /// is called or every socket accept loop has failed.
    pub async fn serve(&self, listeners: BoundListeners) -> Result<(), RuntimeError> {
        info!("🚀 Starting game server");
        let BoundListeners { http, socket } = listeners;
        let token = self.supervisor.token();

        let router = self.http.router();
        self.http.dispatcher().supervisor().spawn(move |token| async move {
            if let Err(e) = axum::serve(http, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!("Http server closed unexpectedly: {}", e);
            }
        });

        self.spawn_status_logger();

        let mut accept_loops = socket
            .into_iter()
            .map(|listener| {
                let gateway = self.socket.clone();
                async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, addr)) => {
                                if let Err(e) = stream.set_nodelay(true) {
                                    warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                                }
                                let session = gateway.clone();
                                gateway
                                    .dispatcher()
                                    .supervisor()
                                    .spawn(move |_| async move { session.accept(stream, addr).await });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                                break;
                            }
                        }
                    }
                }
            })
            .collect::<FuturesUnordered<_>>();

        tokio::select! {
            _ = accept_loops.next() => warn!("Socket accept loop exited"),
            _ = token.cancelled() => info!("Shutdown signal received"),
        }
        drop(accept_loops);

        self.drain().await;
        Ok(())
    }

    fn spawn_status_logger(&self) {
        let period = self.config.status_interval;
        if period.is_zero() {
            return;
        }
        let reporters = self.reporters();
        self.supervisor.spawn(move |token| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => info!("📊 {}", render(&reporters)),
                }
            }
        });
    }

    /// Stops the gateways, then flushes and closes the store.
    async fn drain(&self) {
        info!("🧹 Performing server cleanup...");
        self.supervisor.cancel();
        self.http.dispatcher().supervisor().close_and_wait().await;
        self.socket.dispatcher().supervisor().close_and_wait().await;
        self.store.close().await;
        self.supervisor.close_and_wait().await;
        info!("✅ Server cleanup completed: {}", self.status_line());
    }
}

fn socket_listener(config: &SocketConfig) -> Result<TcpListener, RuntimeError> {
    let domain = if config.bind_address.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| RuntimeError::Network(format!("Socket creation failed: {e}")))?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set SO_REUSEADDR: {}", e);
    }

    if config.use_reuse_port {
        #[cfg(unix)]
        {
            match socket.set_reuse_port(true) {
                Ok(()) => info!("SO_REUSEPORT enabled for load balancing across acceptors"),
                Err(e) => warn!("Failed to set SO_REUSEPORT: {}", e),
            }
        }
        #[cfg(not(unix))]
        {
            warn!("SO_REUSEPORT is not supported on this platform. Using SO_REUSEADDR only.");
        }
    }

    socket
        .bind(&config.bind_address.into())
        .map_err(|e| RuntimeError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| RuntimeError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener
        .set_nonblocking(true)
        .map_err(|e| RuntimeError::Network(format!("Nonblocking mode failed: {e}")))?;
    TcpListener::from_std(std_listener)
        .map_err(|e| RuntimeError::Network(format!("Tokio listener creation failed: {e}")))
}
