use crate::message::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use taskhive_core::Priority;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bounded four-level priority queue.
///
/// Pops are strictly by priority (Critical first) and FIFO within a level.
/// Pushes past capacity wait for room up to a timeout and then fail closed.
/// Retries go through [`requeue`](Self::requeue), which is not bounded, so a
/// message that was already accepted is never lost to back-pressure.
pub struct Mailbox {
    capacity: usize,
    levels: Mutex<[VecDeque<Message>; 4]>,
    not_empty: Notify,
    not_full: Notify,
}

fn slot(priority: Priority) -> usize {
    priority.rank()
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            levels: Mutex::new(Default::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue if there is room right now; hands the message back otherwise.
    pub fn try_push(&self, message: Message) -> Result<(), Message> {
        {
            let mut levels = self.levels.lock();
            let len: usize = levels.iter().map(VecDeque::len).sum();
            if len >= self.capacity {
                return Err(message);
            }
            levels[slot(message.priority)].push_back(message);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, waiting up to `timeout` for room. Returns `false` if the
    /// mailbox stayed full.
    pub async fn push(&self, message: Message, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut message = message;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(message) {
                Ok(()) => return true,
                Err(back) => message = back,
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Enqueue regardless of capacity.
    pub fn requeue(&self, message: Message) {
        self.levels.lock()[slot(message.priority)].push_back(message);
        self.not_empty.notify_one();
    }

    /// Dequeue the most urgent message without waiting.
    pub fn pop(&self) -> Option<Message> {
        let message = {
            let mut levels = self.levels.lock();
            levels.iter_mut().find_map(VecDeque::pop_front)
        };
        if message.is_some() {
            self.not_full.notify_one();
        }
        message
    }

    /// Dequeue the most urgent message, waiting until one arrives or the
    /// token is cancelled.
    pub async fn pop_wait(&self, cancel: &CancellationToken) -> Option<Message> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.pop() {
                return Some(message);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.levels.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue depth per level, most urgent first.
    pub fn depths(&self) -> [usize; 4] {
        let levels = self.levels.lock();
        [
            levels[0].len(),
            levels[1].len(),
            levels[2].len(),
            levels[3].len(),
        ]
    }
}
