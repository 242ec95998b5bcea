//! Per-job topics and their observers
//!
//! Every job gets a topic holding the job's aggregate `JobView` and its observer
//! set. Publishing and joining serialize on one lock, so a joining observer's
//! snapshot and the events that follow it form one gapless, duplicate-free stream.

use super::channel::ObserverChannel;
use super::events::{JobEvent, ProgressEvent, WireStatus};
use super::Subscription;
use crate::job::JobId;
use crate::RelayError;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// The broadcaster's own view of a job, built from published events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobView {
    pub status: WireStatus,
    pub progress: u8,
    pub pages_scraped: u32,
    pub total_pages: u32,
    pub current_url: Option<String>,
    pub errors: Vec<String>,
}

impl JobView {
    fn new(total_pages: u32) -> Self {
        Self {
            status: WireStatus::Pending,
            progress: 0,
            pages_scraped: 0,
            total_pages,
            current_url: None,
            errors: Vec::new(),
        }
    }

    /// Folds a progress event into the view and clamps it to the canonical stream
    fn apply_progress(&mut self, event: &mut ProgressEvent) {
        self.progress = self.progress.max(event.progress);
        self.pages_scraped = self.pages_scraped.max(event.pages_scraped);
        if !self.status.is_terminal() {
            self.status = event.status;
        }
        if let Some(total) = event.total_pages {
            self.total_pages = total;
        }
        self.current_url = event.current_url.clone();
        if event.errors.len() >= self.errors.len() {
            self.errors = event.errors.clone();
        }

        event.progress = self.progress;
        event.pages_scraped = self.pages_scraped;
        event.status = self.status;
    }

    fn to_event(&self, job_id: JobId) -> ProgressEvent {
        ProgressEvent {
            job_id,
            status: self.status,
            progress: self.progress,
            current_url: self.current_url.clone(),
            pages_scraped: self.pages_scraped,
            total_pages: Some(self.total_pages),
            errors: self.errors.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Topic {
    view: JobView,
    observers: HashMap<String, Arc<ObserverChannel>>,
    /// Completion event, kept for observers that join after the job ended
    terminal: Option<JobEvent>,
}

impl Topic {
    fn prune_detached(&mut self) {
        self.observers.retain(|_, channel| !channel.is_detached());
    }
}

/// Fans job events out to every subscribed observer
pub struct Broadcaster {
    capacity: usize,
    topics: Mutex<HashMap<JobId, Topic>>,
}

impl Broadcaster {
    /// Creates a broadcaster whose observers buffer up to `capacity` events each
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Topic>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens the topic of a new job; does nothing if it already exists
    pub fn open(&self, job_id: JobId, total_pages: u32) {
        self.lock().entry(job_id).or_insert_with(|| Topic {
            view: JobView::new(total_pages),
            observers: HashMap::new(),
            terminal: None,
        });
    }

    /// Publishes an event to every observer of its job
    ///
    /// Returns the number of observers the event was delivered to.
    pub fn publish(&self, event: JobEvent) -> usize {
        let job_id = event.job_id();
        let mut topics = self.lock();
        let Some(topic) = topics.get_mut(&job_id) else {
            trace!(job_id = %job_id, "Dropping event for unknown topic");
            return 0;
        };

        if topic.terminal.is_some() {
            trace!(job_id = %job_id, "Dropping event published after completion");
            return 0;
        }

        let mut event = event;
        match &mut event {
            JobEvent::Progress(progress) => topic.view.apply_progress(progress),
            JobEvent::Complete(complete) => {
                topic.view.status = complete.status;
                topic.view.pages_scraped = topic.view.pages_scraped.max(complete.pages_scraped);
                topic.view.errors = complete.errors.clone();
                topic.view.current_url = None;
                topic.terminal = Some(JobEvent::Complete(complete.clone()));
            }
            JobEvent::Error(_) => {}
        }

        topic.prune_detached();
        let terminal = event.is_terminal();
        for channel in topic.observers.values() {
            channel.push(event.clone());
            if terminal {
                channel.close();
            }
        }
        topic.observers.len()
    }

    /// Subscribes `observer_id` to a job
    ///
    /// The subscription first yields a snapshot of the job's current state and,
    /// if the job already ended, its completion event. Joining twice with the same
    /// observer id replaces the earlier subscription.
    pub fn join(&self, job_id: JobId, observer_id: &str) -> Result<Subscription, RelayError> {
        let mut topics = self.lock();
        let topic = topics
            .get_mut(&job_id)
            .ok_or(RelayError::JobNotFound(job_id))?;

        let snapshot = topic.view.to_event(job_id);
        let channel = Arc::new(ObserverChannel::new(self.capacity));
        channel.push(JobEvent::Progress(snapshot.clone()));

        match &topic.terminal {
            Some(terminal) => {
                channel.push(terminal.clone());
                channel.close();
            }
            None => {
                if let Some(previous) = topic
                    .observers
                    .insert(observer_id.to_string(), Arc::clone(&channel))
                {
                    previous.close();
                }
            }
        }

        debug!(job_id = %job_id, observer = %observer_id, "Observer joined");
        Ok(Subscription::new(
            job_id,
            observer_id.to_string(),
            channel,
            snapshot,
        ))
    }

    /// Removes one observer from a job; returns false if it was not subscribed
    pub fn leave(&self, job_id: JobId, observer_id: &str) -> bool {
        let mut topics = self.lock();
        let removed = topics
            .get_mut(&job_id)
            .and_then(|topic| topic.observers.remove(observer_id));

        match removed {
            Some(channel) => {
                channel.close();
                debug!(job_id = %job_id, observer = %observer_id, "Observer left");
                true
            }
            None => false,
        }
    }

    /// Removes an observer from every job it joined; returns how many
    pub fn disconnect(&self, observer_id: &str) -> usize {
        let mut topics = self.lock();
        let mut removed = 0;
        for topic in topics.values_mut() {
            if let Some(channel) = topic.observers.remove(observer_id) {
                channel.close();
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(observer = %observer_id, jobs = removed, "Observer disconnected");
        }
        removed
    }

    /// Drops a job's topic and ends every remaining subscription
    pub fn close(&self, job_id: JobId) {
        if let Some(topic) = self.lock().remove(&job_id) {
            for channel in topic.observers.values() {
                channel.close();
            }
        }
    }

    /// Current snapshot of a job, as a joining observer would receive it
    pub fn snapshot(&self, job_id: JobId) -> Option<ProgressEvent> {
        self.lock()
            .get(&job_id)
            .map(|topic| topic.view.to_event(job_id))
    }

    pub fn view(&self, job_id: JobId) -> Option<JobView> {
        self.lock().get(&job_id).map(|topic| topic.view.clone())
    }

    /// Number of live observers of a job
    pub fn observer_count(&self, job_id: JobId) -> usize {
        self.lock().get(&job_id).map_or(0, |topic| {
            topic
                .observers
                .values()
                .filter(|channel| !channel.is_detached())
                .count()
        })
    }

    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }
}
