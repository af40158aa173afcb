use async_trait::async_trait;

use crate::error::{CoreResult, RelayError};
use crate::model::ConversationTurn;
use crate::stream::ContentStream;

/// Something that turns a conversation history into a stream of increments.
///
/// The session only talks to this trait, so tests can substitute scripted
/// providers for the real upstream.
#[async_trait]
pub trait ChatStreamProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start one exchange. Errors returned here happen before any increment.
    async fn open(&self, turns: &[ConversationTurn]) -> CoreResult<ContentStream>;
}

/// Stand-in used when no chat credential is configured; every exchange
/// fails with `MissingCredential` instead of the relay refusing to start.
pub struct UnconfiguredProvider {
    env: String,
}

impl UnconfiguredProvider {
    pub fn new(env: impl Into<String>) -> Self {
        Self { env: env.into() }
    }
}

#[async_trait]
impl ChatStreamProvider for UnconfiguredProvider {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn open(&self, _turns: &[ConversationTurn]) -> CoreResult<ContentStream> {
        Err(RelayError::MissingCredential {
            env: self.env.clone(),
        })
    }
}
