use crate::message::Message;

/// A step run on every outgoing message before it is queued.
///
/// Returning `None` vetoes the message.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, message: Message) -> Option<Message>;
}

/// Middleware built from a closure.
pub struct FnMiddleware<F> {
    name: String,
    f: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(Message) -> Option<Message> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(Message) -> Option<Message> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, message: Message) -> Option<Message> {
        (self.f)(message)
    }
}

/// Drops messages whose sender is on a block list.
pub struct SenderBlocklist {
    blocked: Vec<String>,
}

impl SenderBlocklist {
    pub fn new(blocked: Vec<String>) -> Self {
        Self { blocked }
    }
}

impl Middleware for SenderBlocklist {
    fn name(&self) -> &str {
        "sender_blocklist"
    }

    fn process(&self, message: Message) -> Option<Message> {
        if self.blocked.iter().any(|b| *b == message.sender) {
            None
        } else {
            Some(message)
        }
    }
}
