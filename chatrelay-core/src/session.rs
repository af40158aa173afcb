//! One client connection and the exchanges run over it.
//!
//! The session is transport-agnostic: it reads raw client messages from any
//! `Stream<Item = String>` and writes `ServerFrame`s into a `FrameSender`.
//! The websocket adapter in `server::ws` owns the socket halves.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::error::RelayError;
use crate::model::ConversationTurn;
use crate::protocol::{ChatRequest, ServerFrame};
use crate::provider::ChatStreamProvider;
use crate::stream::StreamOutcome;
use crate::telemetry::{self, ExchangeLog};

pub const TRACING_TARGET: &str = "chatrelay_core::session";

/// Outbound frames buffered per connection before sends start waiting.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Ordered, bounded queue of frames towards one client.
///
/// Sending never fails: once the receiving side is gone, frames are dropped.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<ServerFrame>,
}

impl FrameSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, frame: ServerFrame) {
        if self.tx.send(frame).await.is_err() {
            tracing::debug!(target: TRACING_TARGET, "client gone; frame dropped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
}

pub struct ConnectionSession {
    id: Uuid,
    provider: Arc<dyn ChatStreamProvider>,
    deadline: Duration,
    state: SessionState,
}

impl ConnectionSession {
    pub fn new(provider: Arc<dyn ChatStreamProvider>, deadline: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            deadline,
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until `inbound` ends.
    pub async fn run<S>(mut self, inbound: S, out: FrameSender)
    where
        S: Stream<Item = String> + Unpin,
    {
        let span = tracing::info_span!(target: TRACING_TARGET, "session", session_id = %self.id);
        async move {
            tracing::info!(target: TRACING_TARGET, "client connected");
            self.serve(inbound, &out).await;
            tracing::info!(target: TRACING_TARGET, "client disconnected");
        }
        .instrument(span)
        .await
    }

    async fn serve<S>(&mut self, mut inbound: S, out: &FrameSender)
    where
        S: Stream<Item = String> + Unpin,
    {
        while let Some(raw) = inbound.next().await {
            let request = match ChatRequest::parse(&raw) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(target: TRACING_TARGET, error = %e, "rejecting client message");
                    out.send(ServerFrame::error(e.client_message())).await;
                    continue;
                }
            };

            self.state = SessionState::Streaming;
            let connected = self.exchange(request.messages, &mut inbound, out).await;
            self.state = SessionState::Idle;
            if !connected {
                break;
            }
        }
    }

    /// Run one exchange to its terminal frame. Returns `false` if the client
    /// went away mid-exchange, in which case the exchange was abandoned.
    async fn exchange<S>(&self, turns: Vec<ConversationTurn>, inbound: &mut S, out: &FrameSender) -> bool
    where
        S: Stream<Item = String> + Unpin,
    {
        let exchange_id = Uuid::new_v4();
        let span = tracing::info_span!(target: TRACING_TARGET, "exchange", exchange_id = %exchange_id);
        let started = Instant::now();

        let drive = drive_exchange(self.provider.as_ref(), &turns, out, self.deadline).instrument(span);
        tokio::pin!(drive);

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut drive => break Some(outcome),
                msg = inbound.next() => match msg {
                    Some(_) => {
                        tracing::debug!(target: TRACING_TARGET, exchange_id = %exchange_id, "busy; message ignored");
                        out.send(ServerFrame::error(RelayError::Busy.client_message())).await;
                    }
                    None => break None,
                },
            }
        };

        let log = ExchangeLog::new(self.id.to_string(), exchange_id.to_string())
            .upstream(self.provider.name())
            .latency_ms(started.elapsed().as_millis() as u64);

        let Some(outcome) = outcome else {
            // `drive` is dropped with this frame, cancelling the upstream read.
            telemetry::emit_exchange(log.outcome("cancelled"));
            return false;
        };

        let log = log.outcome(outcome.label());
        match outcome {
            StreamOutcome::Delivered { increments } => {
                out.send(ServerFrame::done()).await;
                telemetry::emit_exchange(log.increments(increments));
            }
            StreamOutcome::Failed(e) => {
                tracing::warn!(target: TRACING_TARGET, exchange_id = %exchange_id, error = %e, "exchange failed");
                let reason = e.client_message();
                out.send(ServerFrame::error(reason.as_str())).await;
                telemetry::emit_exchange(log.error(e.kind(), &reason));
            }
            StreamOutcome::TimedOut => {
                let e = RelayError::Timeout {
                    secs: self.deadline.as_secs(),
                };
                tracing::warn!(target: TRACING_TARGET, exchange_id = %exchange_id, "exchange deadline expired");
                let reason = e.client_message();
                out.send(ServerFrame::error(reason.as_str())).await;
                telemetry::emit_exchange(log.error(e.kind(), &reason));
            }
        }
        true
    }
}

/// One exchange under a single wall-clock deadline. On expiry the upstream
/// stream is dropped, so nothing it yields afterwards reaches the client.
async fn drive_exchange(
    provider: &dyn ChatStreamProvider,
    turns: &[ConversationTurn],
    out: &FrameSender,
    deadline: Duration,
) -> StreamOutcome {
    match tokio::time::timeout(deadline, forward(provider, turns, out)).await {
        Ok(outcome) => outcome,
        Err(_) => StreamOutcome::TimedOut,
    }
}

async fn forward(provider: &dyn ChatStreamProvider, turns: &[ConversationTurn], out: &FrameSender) -> StreamOutcome {
    let mut stream = match provider.open(turns).await {
        Ok(s) => s,
        Err(e) => return StreamOutcome::Failed(e),
    };

    let mut increments = 0;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                out.send(ServerFrame::content(event.text)).await;
                increments += 1;
            }
            Err(e) => return StreamOutcome::Failed(e),
        }
    }
    StreamOutcome::Delivered { increments }
}
