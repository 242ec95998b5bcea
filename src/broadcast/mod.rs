//! Progress broadcasting
//!
//! Job progress is published to per-job topics by the scheduler. Any number of
//! observers may join a topic; each gets its own bounded buffer, a snapshot of
//! the job's state on join, and the job's completion event at the end.
//!
//! # Components
//!
//! - `JobEvent`: progress, completion and error events with their JSON shape
//! - `Broadcaster`: the topic hub (`open`, `publish`, `join`, `leave`, `disconnect`)
//! - `Subscription`: one observer's receiving end

mod channel;
mod events;
mod hub;

pub use events::{CompletionEvent, ErrorEvent, JobEvent, ProgressEvent, WireStatus};
pub use hub::{Broadcaster, JobView};

use crate::job::JobId;
use channel::ObserverChannel;
use std::sync::Arc;

/// One observer's subscription to a job's events
///
/// Dropping the subscription unsubscribes the observer.
#[derive(Debug)]
pub struct Subscription {
    job_id: JobId,
    observer_id: String,
    channel: Arc<ObserverChannel>,
    snapshot: ProgressEvent,
}

impl Subscription {
    fn new(
        job_id: JobId,
        observer_id: String,
        channel: Arc<ObserverChannel>,
        snapshot: ProgressEvent,
    ) -> Self {
        Self {
            job_id,
            observer_id,
            channel,
            snapshot,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn observer_id(&self) -> &str {
        &self.observer_id
    }

    /// State of the job at the moment of joining
    pub fn snapshot(&self) -> &ProgressEvent {
        &self.snapshot
    }

    /// Waits for the next event
    ///
    /// Returns None after the completion event has been read, or once the
    /// observer left or the topic was closed.
    pub async fn recv(&self) -> Option<JobEvent> {
        self.channel.recv().await
    }

    /// Returns the next buffered event without waiting
    pub fn try_recv(&self) -> Option<JobEvent> {
        self.channel.try_recv()
    }

    /// Number of intermediate events dropped because this observer fell behind
    pub fn dropped_events(&self) -> u64 {
        self.channel.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.detach();
    }
}
