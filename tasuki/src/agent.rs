//! The agent contract.
//!
//! An agent consumes a message and produces a message. The planner and
//! executor are the two core implementations; the orchestrator tracks
//! agents behind this same shape.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

/// A named actor producing messages in response to messages.
#[async_trait]
pub trait Agent: Send {
    /// The agent's name, used for events, rate limiting, and spans.
    fn name(&self) -> &str;

    /// Process one message synchronously.
    ///
    /// # Errors
    ///
    /// Implementation-specific; rate-limit and parse failures surface here.
    fn step(&mut self, incoming: Message) -> Result<Message>;

    /// Process one message from an async context.
    ///
    /// The default runs the synchronous path inline. Implementations with
    /// genuinely asynchronous work (LLM calls, async tools) override this.
    ///
    /// # Errors
    ///
    /// Same contract as [`Agent::step`].
    async fn step_async(&mut self, incoming: Message) -> Result<Message> {
        self.step(incoming)
    }
}
