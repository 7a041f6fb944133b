use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Bounded FIFO feeding a single writer task.
///
/// When full, `push` evicts the oldest entry so the newest messages always
/// survive a stalled writer.
#[derive(Debug)]
pub struct Outbox<T> {
    max: usize,
    state: Mutex<OutboxState<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct OutboxState<T> {
    items: VecDeque<T>,
    draining: bool,
}

impl<T> Outbox<T> {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            state: Mutex::new(OutboxState {
                items: VecDeque::with_capacity(max),
                draining: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Appends `item`, returning the entry evicted to make room, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let dropped = {
            let mut state = self.state.lock();
            let dropped = if state.items.len() >= self.max {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Puts `item` ahead of everything queued.
    pub fn push_front(&self, item: T) {
        {
            let mut state = self.state.lock();
            state.items.push_front(item);
            state.items.truncate(self.max);
        }
        self.notify.notify_one();
    }

    pub fn clear(&self) {
        self.state.lock().items.clear();
    }

    /// After this, `pop` returns `None` once the queue runs empty.
    pub fn begin_drain(&self) {
        self.state.lock().draining = true;
        self.notify.notify_one();
    }

    /// Waits for the next item. Cancel-safe: an item is only removed when
    /// the call completes.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.draining {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.state.lock().items.iter().cloned().collect()
    }
}
