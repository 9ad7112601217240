mod core;

pub use self::core::{BoundListeners, GameServer};
