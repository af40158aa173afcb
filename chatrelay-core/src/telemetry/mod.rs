//! Telemetry primitives for the relay.
//! Every record is also logged through `tracing`; a sink installed via
//! `set_telemetry_sink` additionally receives the structured value.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

const TRACING_TARGET: &str = "chatrelay_core::telemetry";

/// Implement this to receive structured exchange/task records.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - Methods may be called from any runtime worker; they must not block.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_exchange(&self, log: ExchangeLog);

    fn record_task(&self, _log: TaskLog) {}
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate sink delivery to the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

fn sink() -> Option<&'static Arc<dyn TelemetrySink>> {
    #[cfg(test)]
    {
        if !TEST_CAPTURE.with(|c| c.get()) {
            return None;
        }
    }
    TELEMETRY_SINK.get()
}

pub(crate) fn emit_exchange(log: ExchangeLog) {
    tracing::info!(
        target: TRACING_TARGET,
        session_id = %log.session_id,
        exchange_id = %log.exchange_id,
        upstream = log.upstream.as_deref().unwrap_or("-"),
        outcome = %log.outcome,
        increments = log.increments,
        latency_ms = log.latency_ms,
        error_kind = log.error_kind.as_deref(),
        "exchange finished"
    );
    if let Some(sink) = sink() {
        sink.record_exchange(log);
    }
}

pub(crate) fn emit_task(log: TaskLog) {
    tracing::info!(
        target: TRACING_TARGET,
        task_id = %log.task_id,
        status = %log.status,
        poll_attempts = log.poll_attempts,
        images = log.images,
        latency_ms = log.latency_ms,
        error_kind = log.error_kind.as_deref(),
        "task finished"
    );
    if let Some(sink) = sink() {
        sink.record_task(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable sink delivery for the current test thread.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}

/// Test-only sink shared by every module's tests; install with
/// `test_capture_sink()` and filter records by id.
#[cfg(test)]
#[derive(Default)]
pub struct CaptureSink {
    pub exchanges: std::sync::Mutex<Vec<ExchangeLog>>,
    pub tasks: std::sync::Mutex<Vec<TaskLog>>,
}

#[cfg(test)]
impl TelemetrySink for CaptureSink {
    fn record_exchange(&self, log: ExchangeLog) {
        self.exchanges.lock().unwrap().push(log);
    }
    fn record_task(&self, log: TaskLog) {
        self.tasks.lock().unwrap().push(log);
    }
}

#[cfg(test)]
static CAPTURE: once_cell::sync::Lazy<Arc<CaptureSink>> =
    once_cell::sync::Lazy::new(|| Arc::new(CaptureSink::default()));

/// Install the shared capture sink (idempotent) and enable capture on this thread.
#[cfg(test)]
pub fn test_capture_sink() -> Arc<CaptureSink> {
    let sink = CAPTURE.clone();
    let _ = set_telemetry_sink(sink.clone());
    test_set_capture_enabled(true);
    sink
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_is_gated_per_thread() {
        let sink = test_capture_sink();
        emit_exchange(ExchangeLog::new("gate-s", "gate-x").outcome("delivered"));

        std::thread::spawn(|| {
            emit_exchange(ExchangeLog::new("gate-s", "other-thread").outcome("delivered"));
        })
        .join()
        .unwrap();

        let seen: Vec<_> = sink
            .exchanges
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.session_id == "gate-s")
            .map(|l| l.exchange_id.clone())
            .collect();
        assert_eq!(seen, vec!["gate-x".to_string()]);
    }

    #[test]
    fn records_are_logged_under_the_shared_keys() {
        let (store, _guard) = test_span::install_capture();
        emit_exchange(
            ExchangeLog::new("keys-s", "keys-x")
                .upstream("chat")
                .outcome("failed")
                .increments(2)
                .latency_ms(15)
                .error("timeout", "upstream response timed out after 30s"),
        );
        emit_task(
            TaskLog::new("keys-t")
                .status("FAILED")
                .poll_attempts(3)
                .latency_ms(4000)
                .error_kind("poll_budget"),
        );

        let exchange = store.event("exchange finished").expect("exchange event");
        assert_eq!(exchange.name, TRACING_TARGET);
        assert_eq!(exchange.field(KEY_SESSION_ID).as_deref(), Some("keys-s"));
        assert_eq!(exchange.field(KEY_EXCHANGE_ID).as_deref(), Some("keys-x"));
        assert_eq!(exchange.field(KEY_UPSTREAM).as_deref(), Some("chat"));
        assert_eq!(exchange.field(KEY_OUTCOME).as_deref(), Some("failed"));
        assert_eq!(exchange.field(KEY_INCREMENTS).as_deref(), Some("2"));
        assert_eq!(exchange.field(KEY_LATENCY_MS).as_deref(), Some("15"));
        assert_eq!(exchange.field(KEY_ERROR_KIND).as_deref(), Some("timeout"));

        let task = store.event("task finished").expect("task event");
        assert_eq!(task.field(KEY_TASK_ID).as_deref(), Some("keys-t"));
        assert_eq!(task.field(KEY_POLL_ATTEMPTS).as_deref(), Some("3"));
        assert_eq!(task.field(KEY_ERROR_KIND).as_deref(), Some("poll_budget"));
    }
}
