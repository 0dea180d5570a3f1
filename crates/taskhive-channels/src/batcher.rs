use crate::message::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-recipient buffers for batched routes.
///
/// A buffer is flushed when it reaches `batch_size` messages or when its
/// oldest message has waited `window`, whichever comes first.
pub struct Batcher {
    batch_size: usize,
    window: Duration,
    buffers: Mutex<HashMap<String, Buffer>>,
}

struct Buffer {
    messages: Vec<Message>,
    opened: Instant,
}

/// A flushed batch bound for one recipient.
#[derive(Debug)]
pub struct Batch {
    pub recipient: String,
    pub messages: Vec<Message>,
}

impl Batcher {
    pub fn new(batch_size: usize, window: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            window,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Buffer a message. Returns the full batch when this push filled it.
    pub fn push(&self, message: Message) -> Option<Batch> {
        let mut buffers = self.buffers.lock();
        let recipient = message.recipient.clone();
        let buffer = buffers.entry(recipient.clone()).or_insert_with(|| Buffer {
            messages: Vec::with_capacity(self.batch_size),
            opened: Instant::now(),
        });
        buffer.messages.push(message);
        if buffer.messages.len() < self.batch_size {
            return None;
        }
        buffers.remove(&recipient).map(|b| Batch {
            recipient,
            messages: b.messages,
        })
    }

    /// Remove every buffer whose window has elapsed at `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<Batch> {
        let mut buffers = self.buffers.lock();
        let expired: Vec<String> = buffers
            .iter()
            .filter(|(_, b)| now.duration_since(b.opened) >= self.window)
            .map(|(r, _)| r.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|recipient| {
                buffers.remove(&recipient).map(|b| Batch {
                    recipient,
                    messages: b.messages,
                })
            })
            .collect()
    }

    /// Remove every buffer regardless of age.
    pub fn drain_all(&self) -> Vec<Batch> {
        self.buffers
            .lock()
            .drain()
            .map(|(recipient, b)| Batch {
                recipient,
                messages: b.messages,
            })
            .collect()
    }

    /// Messages currently buffered across all recipients.
    pub fn pending(&self) -> usize {
        self.buffers.lock().values().map(|b| b.messages.len()).sum()
    }
}
