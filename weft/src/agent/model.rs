//! The model client boundary (spec.md §1): an LLM SDK is consumed as an opaque
//! "generate a stream of [`StreamPart`]s from a resolved prompt" interface. `weft` never
//! reaches inside a provider's request/response shape — it only needs the stream.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::engine::Resolved;
use crate::error::AgentError;
use stream_event::StreamPart;

/// A boxed stream of [`StreamPart`]s, owned so it can outlive the call that produced it.
pub type PartStream = Pin<Box<dyn Stream<Item = StreamPart> + Send>>;

/// The minimal surface an LLM SDK needs to expose for the agent loop to drive it.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(&self, resolved: &Resolved) -> Result<PartStream, AgentError>;
}
