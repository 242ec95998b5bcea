use super::{Transport, TransportError};
use crate::broadcast::Subscription;
use crate::coordinator::Coordinator;
use crate::job::JobId;
use crate::RelayError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// In-process transport that joins jobs directly on a `Coordinator`
pub struct LocalTransport {
    coordinator: Arc<Coordinator>,
    observer_id: String,
    connected: bool,
    subscriptions: HashMap<JobId, Subscription>,
}

impl LocalTransport {
    pub fn new(coordinator: Arc<Coordinator>, observer_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            observer_id: observer_id.into(),
            connected: false,
            subscriptions: HashMap::new(),
        }
    }

    pub fn observer_id(&self) -> &str {
        &self.observer_id
    }

    /// Current subscription to a joined job
    pub fn subscription(&self, job_id: JobId) -> Option<&Subscription> {
        self.subscriptions.get(&job_id)
    }

    /// Simulates the connection dropping: every subscription is lost
    pub fn drop_connection(&mut self) {
        self.connected = false;
        self.subscriptions.clear();
        let left = self.coordinator.disconnect(&self.observer_id);
        debug!(observer = %self.observer_id, jobs = left, "Connection dropped");
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.coordinator.is_shutting_down() {
            return Err(TransportError::Connect(
                "coordinator is shutting down".to_string(),
            ));
        }
        self.connected = true;
        Ok(())
    }

    async fn join(&mut self, job_id: JobId) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }

        match self.coordinator.join(job_id, &self.observer_id) {
            Ok(subscription) => {
                self.subscriptions.insert(job_id, subscription);
                Ok(())
            }
            Err(e @ RelayError::JobNotFound(_)) => Err(TransportError::Rejected(e.to_string())),
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }

    async fn leave(&mut self, job_id: JobId) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        self.subscriptions.remove(&job_id);
        self.coordinator.leave(job_id, &self.observer_id);
        Ok(())
    }
}
