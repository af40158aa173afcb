use serde::Serialize;

/// Structured record of one streaming exchange, emitted once it ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct ExchangeLog {
    pub session_id: String,
    pub exchange_id: String,

    /// Provider name, e.g. "chat".
    pub upstream: Option<String>,

    /// `StreamOutcome::label()` of the exchange.
    pub outcome: String,

    /// Content frames forwarded to the client.
    pub increments: usize,
    pub latency_ms: u64,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl ExchangeLog {
    pub fn new(session_id: impl Into<String>, exchange_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            exchange_id: exchange_id.into(),
            ..Default::default()
        }
    }

    pub fn upstream(mut self, v: &str) -> Self {
        self.upstream = Some(v.to_string());
        self
    }
    pub fn outcome(mut self, v: &str) -> Self {
        self.outcome = v.to_string();
        self
    }
    pub fn increments(mut self, n: usize) -> Self {
        self.increments = n;
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
}

/// Structured record of one image-generation task once the bridge stops
/// tracking it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct TaskLog {
    pub task_id: String,
    /// Terminal status as sent to clients (`SUCCEEDED`, `FAILED`).
    pub status: String,
    pub poll_attempts: u32,
    pub images: usize,
    pub latency_ms: u64,
    pub error_kind: Option<String>,
}

impl TaskLog {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn status(mut self, v: &str) -> Self {
        self.status = v.to_string();
        self
    }
    pub fn poll_attempts(mut self, n: u32) -> Self {
        self.poll_attempts = n;
        self
    }
    pub fn images(mut self, n: usize) -> Self {
        self.images = n;
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }
    pub fn error_kind(mut self, kind: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exchange_log_serializes() {
        let log = ExchangeLog::new("s-1", "x-1")
            .upstream("chat")
            .outcome("failed")
            .increments(3)
            .latency_ms(42)
            .error("http_status", "upstream request failed with status 500");

        let v = serde_json::to_value(&log).unwrap();
        assert_eq!(v["session_id"], json!("s-1"));
        assert_eq!(v["upstream"], json!("chat"));
        assert_eq!(v["increments"], json!(3));
        assert_eq!(v["error_kind"], json!("http_status"));
    }

    #[test]
    fn task_log_defaults_to_no_error() {
        let log = TaskLog::new("t-1").status("SUCCEEDED").images(1).poll_attempts(3);
        let v = serde_json::to_value(&log).unwrap();
        assert_eq!(v["status"], json!("SUCCEEDED"));
        assert_eq!(v["error_kind"], json!(null));
    }
}
