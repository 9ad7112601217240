//! Per-session connection metadata.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime};

use uuid::Uuid;

/// Unique identifier of one accepted socket session.
pub type ConnectionId = Uuid;

/// Key id of a session nobody has claimed yet.
pub const UNBOUND_KEY_ID: i64 = -1;

type CloseCallback = Box<dyn FnOnce(&ConnectionInfo) + Send>;

/// An accepted socket session as seen by handlers.
///
/// Handlers can bind the session to an account through [`set_key_id`] and
/// register a close callback; the session fires that callback exactly once
/// when it ends, whatever ended it.
///
/// [`set_key_id`]: ConnectionInfo::set_key_id
pub struct ConnectionInfo {
    id: ConnectionId,
    remote_addr: SocketAddr,
    connected_at: SystemTime,
    opened: Instant,
    key_id: AtomicI64,
    on_close: Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
}

impl ConnectionInfo {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            connected_at: SystemTime::now(),
            opened: Instant::now(),
            key_id: AtomicI64::new(UNBOUND_KEY_ID),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn age(&self) -> std::time::Duration {
        self.opened.elapsed()
    }

    pub fn key_id(&self) -> i64 {
        self.key_id.load(Ordering::Acquire)
    }

    pub fn set_key_id(&self, key_id: i64) {
        self.key_id.store(key_id, Ordering::Release);
    }

    pub fn is_bound(&self) -> bool {
        self.key_id() != UNBOUND_KEY_ID
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sets the close callback, replacing any earlier one.
    ///
    /// Registering after the session closed runs nothing.
    pub fn on_close(&self, callback: impl FnOnce(&ConnectionInfo) + Send + 'static) {
        if let Ok(mut slot) = self.on_close.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Marks the session closed and runs the close callback.
    ///
    /// Returns `false` when the session was already closed.
    pub fn fire_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callback = self.on_close.lock().ok().and_then(|mut slot| slot.take());
        if let Some(callback) = callback {
            callback(self);
        }
        true
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("key_id", &self.key_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
