//! Bounded per-observer event buffer
//!
//! Each observer reads from its own buffer, so a slow observer never blocks the
//! publisher or other observers. When the buffer is full the oldest intermediate
//! event is dropped: progress events first, then error events. Completion events
//! are never dropped, even if that takes the buffer over capacity.

use super::events::JobEvent;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct ChannelState {
    buffer: VecDeque<JobEvent>,
    /// No more events will be pushed
    closed: bool,
    /// The receiving side is gone
    detached: bool,
    dropped: u64,
}

/// Single-consumer buffer shared between the hub and one `Subscription`
#[derive(Debug)]
pub(crate) struct ObserverChannel {
    state: Mutex<ChannelState>,
    notify: Notify,
    capacity: usize,
}

impl ObserverChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends an event, evicting the oldest intermediate event when full
    pub(crate) fn push(&self, event: JobEvent) {
        {
            let mut state = self.lock();
            if state.closed || state.detached {
                return;
            }

            if state.buffer.len() >= self.capacity {
                if evict_one(&mut state.buffer) {
                    state.dropped += 1;
                } else if !event.is_terminal() {
                    state.dropped += 1;
                    return;
                }
            }

            state.buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Marks the channel closed; buffered events remain readable
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Marks the receiving side as gone
    pub(crate) fn detach(&self) {
        let mut state = self.lock();
        state.detached = true;
        state.buffer.clear();
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.lock().detached
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub(crate) fn try_recv(&self) -> Option<JobEvent> {
        self.lock().buffer.pop_front()
    }

    /// Waits for the next event; None once the channel is closed and drained
    pub(crate) async fn recv(&self) -> Option<JobEvent> {
        loop {
            {
                let mut state = self.lock();
                if let Some(event) = state.buffer.pop_front() {
                    return Some(event);
                }
                if state.closed || state.detached {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Removes the oldest progress event, or failing that the oldest error event
fn evict_one(buffer: &mut VecDeque<JobEvent>) -> bool {
    let victim = buffer
        .iter()
        .position(|e| matches!(e, JobEvent::Progress(_)))
        .or_else(|| buffer.iter().position(|e| matches!(e, JobEvent::Error(_))));

    match victim {
        Some(index) => {
            buffer.remove(index);
            true
        }
        None => false,
    }
}
