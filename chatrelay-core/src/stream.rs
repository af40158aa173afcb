//! Streaming primitives shared by the upstream client and the session.
//!
//! Contract:
//! - An upstream stream yields 0..n `Ok(ContentEvent)` items in arrival order.
//! - `None` means the upstream signalled end-of-stream (or its body ran out).
//! - An `Err` item is fatal for the exchange; callers stop polling after it.
//! - Dropping the stream releases the underlying connection.

use crate::error::RelayError;

/// One increment of assistant output. May be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEvent {
    pub text: String,
}

impl ContentEvent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Terminal state of one streaming exchange.
///
/// `Failed` holds `RelayError`, which is not `Clone`/`Eq`, so neither is this.
#[derive(Debug)]
pub enum StreamOutcome {
    /// `[DONE]` was seen (or the body ended cleanly); `increments` were forwarded.
    Delivered { increments: usize },
    Failed(RelayError),
    TimedOut,
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Boxed, single-pass stream of content increments.
pub type ContentStream =
    futures::stream::BoxStream<'static, crate::error::CoreResult<ContentEvent>>;
