// Veera Core Engine — Remote Inference Clients
// RemoteClient is the seam between the turn driver and whatever hosted
// model serves the session. The driver only ever sees the trait and the
// event stream it returns, so swapping backends never touches the
// accumulator, pacer, or store.

pub mod gemini;

pub use gemini::GeminiClient;

use crate::atoms::error::EngineResult;
use crate::engine::types::{ChatSettings, ImageAttachment, Message, StreamEvent};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of engine events produced by one remote turn. Each item carries
/// the cumulative text so far (not a delta) plus any citation records that
/// arrived with that payload. An `Err` item ends the turn through the
/// failure path; the stream simply ending means a clean completion.
pub type EventStream = Pin<Box<dyn Stream<Item = EngineResult<StreamEvent>> + Send>>;

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Short backend name used in logs and error messages.
    fn name(&self) -> &str;

    /// Open a streaming turn. `history` is the conversation so far,
    /// excluding the new user input, which is passed separately with its
    /// optional image attachment.
    async fn stream_chat(
        &self,
        history: &[Message],
        input: &str,
        image: Option<&ImageAttachment>,
        settings: &ChatSettings,
    ) -> EngineResult<EventStream>;
}
