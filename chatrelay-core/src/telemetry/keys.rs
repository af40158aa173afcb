/// Span/log field keys used by the relay.
/// Keep these stable; changing them is a breaking change for log queries.
pub const KEY_SESSION_ID: &str = "session_id";
pub const KEY_EXCHANGE_ID: &str = "exchange_id";
pub const KEY_TASK_ID: &str = "task_id";

pub const KEY_UPSTREAM: &str = "upstream";

pub const KEY_OUTCOME: &str = "outcome";
pub const KEY_INCREMENTS: &str = "increments";
pub const KEY_LATENCY_MS: &str = "latency_ms";
pub const KEY_POLL_ATTEMPTS: &str = "poll_attempts";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error_kind";
