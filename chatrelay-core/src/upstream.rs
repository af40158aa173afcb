//! Client for the upstream token-streaming completion endpoint.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::stream::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::ChatCfg;
use crate::error::CoreResult;
use crate::frame::{Frame, FrameDecoder};
use crate::http_client::{ByteStream, HttpClient};
use crate::model::ConversationTurn;
use crate::provider::ChatStreamProvider;
use crate::stream::{ContentEvent, ContentStream};

const TRACING_TARGET: &str = "chatrelay_core::upstream";

/// Label used in errors and logs for this upstream.
pub const UPSTREAM_CHAT: &str = "chat";

#[derive(Debug, Clone)]
pub struct UpstreamStreamClient {
    http: HttpClient,
    base: String,
    model: String,
    api_key: SecretString,
}

impl UpstreamStreamClient {
    pub fn new(http: HttpClient, api_key: SecretString, base: String, model: String) -> Self {
        Self {
            http,
            base,
            model,
            api_key,
        }
    }

    pub fn from_config(http: HttpClient, api_key: SecretString, cfg: &ChatCfg) -> Self {
        Self::new(http, api_key, cfg.base_url.clone(), cfg.model.clone())
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        Self::new(
            HttpClient::new_default().unwrap(),
            SecretString::new("test-key".into()),
            server_base.to_string(),
            "glm-3-turbo".to_string(),
        )
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base.trim_end_matches('/'))
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct CompletionReq<'a> {
    model: &'a str,
    stream: bool,
    messages: &'a [ConversationTurn],
}

#[async_trait]
impl ChatStreamProvider for UpstreamStreamClient {
    fn name(&self) -> &str {
        UPSTREAM_CHAT
    }

    async fn open(&self, turns: &[ConversationTurn]) -> CoreResult<ContentStream> {
        let payload = CompletionReq {
            model: &self.model,
            stream: true,
            messages: turns,
        };
        let auth = format!("Bearer {}", self.api_key.expose_secret());
        let body = self
            .http
            .post_stream(UPSTREAM_CHAT, &self.url(), &payload, &[("Authorization", auth.as_str())])
            .await?;
        tracing::debug!(target: TRACING_TARGET, model = %self.model, turns = turns.len(), "upstream stream opened");
        Ok(Box::pin(EventStream::new(body)))
    }
}

/// Lazy, single-pass adapter from raw body chunks to content increments.
///
/// The body is dropped (and the connection released) as soon as `[DONE]`
/// is decoded, the body ends, a read fails, or the stream itself is dropped.
pub(crate) struct EventStream {
    body: Option<ByteStream>,
    decoder: FrameDecoder,
    ready: VecDeque<ContentEvent>,
    ended: bool,
}

impl EventStream {
    pub(crate) fn new(body: ByteStream) -> Self {
        Self {
            body: Some(body),
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            ended: false,
        }
    }

    fn absorb(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Content(ev) => self.ready.push_back(ev),
                Frame::Done => {
                    self.release();
                    return;
                }
            }
        }
    }

    fn release(&mut self) {
        self.ended = true;
        self.body = None;
    }
}

impl Stream for EventStream {
    type Item = CoreResult<ContentEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            // Drain already-decoded increments first so ordering is preserved.
            if let Some(ev) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }
            if self.ended {
                return Poll::Ready(None);
            }
            let Some(body) = self.body.as_mut() else {
                return Poll::Ready(None);
            };

            match body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let frames = self.decoder.push(&chunk);
                    self.absorb(frames);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.release();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    let frames = self.decoder.finish();
                    self.absorb(frames);
                    if !self.decoder.is_finished() {
                        tracing::debug!(target: TRACING_TARGET, "upstream body ended without [DONE]");
                    }
                    self.release();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
