use serde::{Deserialize, Serialize};

/// Body of `POST /auth/login`.
/// Password is redacted in Debug output to prevent accidental logging.
#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// Existing session to re-attach to. Ignored unless it resolves to a
    /// cached session belonging to the same user.
    pub session_id: Option<String>,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

/// Application close codes in the custom 4000+ range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    TokenExpired,
    InvalidFrameType,
    InvalidJson,
    MissingField,
    InvalidType,
    InvalidValue,
}

impl CloseCode {
    pub const fn code(self) -> u16 {
        match self {
            CloseCode::TokenExpired => 4000,
            CloseCode::InvalidFrameType => 4001,
            CloseCode::InvalidJson => 4002,
            CloseCode::MissingField => 4003,
            CloseCode::InvalidType => 4004,
            CloseCode::InvalidValue => 4005,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            CloseCode::TokenExpired => "token expired",
            CloseCode::InvalidFrameType => "invalid frame type",
            CloseCode::InvalidJson => "invalid json",
            CloseCode::MissingField => "missing field",
            CloseCode::InvalidType => "invalid type",
            CloseCode::InvalidValue => "invalid value",
        }
    }
}

/// Messages pushed from the server down a WebSocket connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement to an operator that a job entered the queue.
    Queued { task_id: i64 },
    /// Job dispatched to an autopilot worker.
    Task { task_id: i64 },
}

/// Inbound operation names. Client frames are parsed field-by-field on the
/// server so that malformed input maps onto the precise close code, but the
/// accepted `op` values are pinned here.
pub const OP_QUEUE_TASK: &str = "queue_task";
pub const OP_ACK: &str = "ack";
