use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric status carried in every reply. Shared by HTTP and socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseCode(pub u32);

impl ResponseCode {
    pub const REQUEST_FAILED: Self = Self(100);
    /// The handler already replied, or wants no reply at all.
    pub const NO_REPLY: Self = Self(101);
    pub const TIMEOUT: Self = Self(102);

    pub const SUCCESS: Self = Self(200);
    pub const USER_STATUS: Self = Self(201);

    pub const PARAM_ERROR: Self = Self(300);

    pub const NO_LOGIC: Self = Self(400);
    pub const NOT_FOUND: Self = Self(404);

    pub const LOGIC_ERROR: Self = Self(500);
    pub const DATABASE_ERROR: Self = Self(501);
    pub const CONFIG_ERROR: Self = Self(502);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ResponseCode> for u32 {
    fn from(code: ResponseCode) -> Self {
        code.0
    }
}
