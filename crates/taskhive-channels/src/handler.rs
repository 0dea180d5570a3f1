use crate::message::Message;
use async_trait::async_trait;
use taskhive_core::HiveResult;
use tracing::info;

/// Delivers messages to a notification transport.
///
/// Transport failures are returned as errors and retried by the router.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: &Message) -> HiveResult<()>;

    /// Deliver a flushed batch, returning one result per message in order.
    ///
    /// Only messages with an `Err` result are retried, so an implementation
    /// must not report a message as failed once it has reached the
    /// transport. A result list shorter than the batch marks the missing
    /// tail as undelivered. The default hands each message to
    /// [`handle`](Self::handle).
    async fn handle_batch(&self, messages: &[Message]) -> Vec<HiveResult<()>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.handle(message).await);
        }
        results
    }
}

/// Handler that writes each message to the tracing log.
pub struct LogHandler {
    name: String,
}

impl LogHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl MessageHandler for LogHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: &Message) -> HiveResult<()> {
        let text = message.text()?;
        info!(
            handler = %self.name,
            sender = %message.sender,
            recipient = %message.recipient,
            priority = %message.priority,
            content = %text,
            "Notification"
        );
        Ok(())
    }

    async fn handle_batch(&self, messages: &[Message]) -> Vec<HiveResult<()>> {
        info!(handler = %self.name, count = messages.len(), "Notification batch");
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.handle(message).await);
        }
        results
    }
}
