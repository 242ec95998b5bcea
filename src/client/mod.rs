//! Client-side reconnection
//!
//! Observers usually sit behind a connection that can drop. A client library
//! reconnects with bounded exponential backoff and, once connected again,
//! re-joins every job it had joined. Because a join always starts with a
//! snapshot of the job, the re-joined stream picks up where the job is now.
//!
//! `ReconnectingClient` implements that contract over any `Transport`;
//! `LocalTransport` is the in-process transport backed by a `Coordinator`.

mod local;

pub use local::LocalTransport;

use crate::job::JobId;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by a transport or by the reconnect loop
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection closed")]
    Closed,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    GaveUp { attempts: u32 },
}

/// Bounded exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Backoff waits before giving up; None retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt, or None once attempts are exhausted
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }

        let factor = 2u32.saturating_pow((attempt - 1).min(31));
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

/// A connection over which an observer joins and leaves jobs
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn join(&mut self, job_id: JobId) -> Result<(), TransportError>;

    async fn leave(&mut self, job_id: JobId) -> Result<(), TransportError>;
}

/// Observer client that survives dropped connections
pub struct ReconnectingClient<T> {
    transport: T,
    policy: ReconnectPolicy,
    joined: BTreeSet<JobId>,
    connected: bool,
}

impl<T: Transport> ReconnectingClient<T> {
    pub fn new(transport: T, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            joined: BTreeSet::new(),
            connected: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Jobs that will be re-joined after a reconnect
    pub fn joined_jobs(&self) -> Vec<JobId> {
        self.joined.iter().copied().collect()
    }

    /// Connects, backing off between failed attempts
    ///
    /// Returns the number of attempts it took.
    pub async fn connect(&mut self) -> Result<u32, TransportError> {
        let attempts = self.establish(false).await?;
        self.rejoin_all().await?;
        Ok(attempts)
    }

    /// Joins a job and remembers it for later reconnects
    ///
    /// While disconnected the job is only remembered and joined on reconnect.
    pub async fn join(&mut self, job_id: JobId) -> Result<(), TransportError> {
        if !self.connected {
            self.joined.insert(job_id);
            return Ok(());
        }

        match self.transport.join(job_id).await {
            Ok(()) => {
                self.joined.insert(job_id);
                Ok(())
            }
            Err(TransportError::Rejected(reason)) => Err(TransportError::Rejected(reason)),
            Err(e) => {
                self.connected = false;
                self.joined.insert(job_id);
                Err(e)
            }
        }
    }

    /// Leaves a job and forgets it
    pub async fn leave(&mut self, job_id: JobId) -> Result<(), TransportError> {
        self.joined.remove(&job_id);
        if !self.connected {
            return Ok(());
        }

        let result = self.transport.leave(job_id).await;
        if matches!(result, Err(TransportError::Closed)) {
            self.connected = false;
        }
        result
    }

    /// Reconnects after the connection dropped and re-joins every joined job
    ///
    /// Returns the number of attempts it took.
    pub async fn reconnect(&mut self) -> Result<u32, TransportError> {
        self.connected = false;
        let attempts = self.establish(true).await?;
        self.rejoin_all().await?;
        Ok(attempts)
    }

    /// Calls `connect` until it succeeds and returns the number of calls
    ///
    /// Every call after the first waits for the next backoff delay, and so does
    /// the first one when `backoff_first` is set.
    async fn establish(&mut self, backoff_first: bool) -> Result<u32, TransportError> {
        let mut attempts: u32 = 0;
        let mut waits: u32 = 0;
        loop {
            if backoff_first || attempts > 0 {
                waits += 1;
                let Some(delay) = self.policy.delay(waits) else {
                    warn!(attempts, "Giving up reconnecting");
                    return Err(TransportError::GaveUp { attempts });
                };
                debug!(attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "Reconnecting");
                tokio::time::sleep(delay).await;
            }

            attempts += 1;
            match self.transport.connect().await {
                Ok(()) => {
                    self.connected = true;
                    info!(attempt = attempts, "Connected");
                    return Ok(attempts);
                }
                Err(e) => warn!(attempt = attempts, error = %e, "Connection attempt failed"),
            }
        }
    }

    async fn rejoin_all(&mut self) -> Result<(), TransportError> {
        let jobs: Vec<JobId> = self.joined.iter().copied().collect();
        for job_id in jobs {
            match self.transport.join(job_id).await {
                Ok(()) => debug!(job_id = %job_id, "Re-joined job"),
                Err(TransportError::Rejected(reason)) => {
                    warn!(job_id = %job_id, reason = %reason, "Job no longer joinable");
                    self.joined.remove(&job_id);
                }
                Err(e) => {
                    self.connected = false;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
