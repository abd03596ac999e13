//! Periodic status polling with a single shared snapshot.
//!
//! Readers never wait on the device. They look at whatever complete snapshot the last
//! successful poll published; a failed poll leaves that snapshot in place and only flips the
//! reported availability.

use crate::protocol::{StatusSnapshot, ZeoField};
use crate::status_client::StatusClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A poll that did not produce a new snapshot.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("update failed: {0}")]
pub struct UpdateFailed(pub String);

impl UpdateFailed {
    fn from_error(e: &dyn std::error::Error) -> Self {
        let mut description = e.to_string();
        let mut cause = e.source();
        while let Some(e) = cause {
            description.push_str(": ");
            description.push_str(&e.to_string());
            cause = e.source();
        }
        Self(description)
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "coordinator::Args")]
pub struct Args {
    /// How often the washer status is polled.
    #[arg(long, default_value = "60s")]
    poll_interval: humantime::Duration,

    /// Upper bound on a single poll.
    ///
    /// A poll that takes longer is abandoned and counts as failed.
    #[arg(long, default_value = "40s")]
    poll_timeout: humantime::Duration,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60).into(),
            poll_timeout: Duration::from_secs(40).into(),
        }
    }
}

impl Args {
    pub fn interval(&self) -> Duration {
        *self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        *self.poll_timeout
    }
}

/// Outcome of the most recent poll.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PollStatus {
    pub last_update_success: bool,
    pub last_success: Option<jiff::Timestamp>,
    pub last_error: Option<UpdateFailed>,
}

pub struct PollCoordinator {
    client: Arc<dyn StatusClient>,
    snapshot: watch::Sender<Arc<StatusSnapshot>>,
    status: watch::Sender<PollStatus>,
    in_flight: tokio::sync::Mutex<()>,
    interval: Duration,
    timeout: Duration,
}

impl PollCoordinator {
    pub fn new(client: Arc<dyn StatusClient>, args: &Args) -> Self {
        Self {
            client,
            snapshot: watch::Sender::new(Arc::default()),
            status: watch::Sender::new(PollStatus::default()),
            in_flight: tokio::sync::Mutex::new(()),
            interval: args.interval(),
            timeout: args.timeout(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll every recognized field once.
    pub async fn refresh(&self) -> Result<(), UpdateFailed> {
        let _in_flight = self.in_flight.lock().await;
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.client.update_values(ZeoField::ALL));
        let outcome = match result.await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => Err(UpdateFailed::from_error(&e)),
            Err(_) => Err(UpdateFailed(format!(
                "status request timed out after {}",
                humantime::format_duration(self.timeout)
            ))),
        };
        match outcome {
            Ok(snapshot) => {
                debug!(
                    message = "status poll finished",
                    fields = snapshot.len(),
                    elapsed = ?started.elapsed()
                );
                self.snapshot.send_replace(Arc::new(snapshot));
                let previous = self.status.send_replace(PollStatus {
                    last_update_success: true,
                    last_success: Some(jiff::Timestamp::now()),
                    last_error: None,
                });
                if previous.last_error.is_some() {
                    info!("status polling recovered");
                }
                Ok(())
            }
            Err(e) => {
                self.status.send_modify(|status| {
                    status.last_update_success = false;
                    status.last_error = Some(e.clone());
                });
                Err(e)
            }
        }
    }

    /// The refresh that gates setup. Identical to [`Self::refresh`] apart from logging.
    pub async fn first_refresh(&self) -> Result<(), UpdateFailed> {
        self.refresh().await.inspect_err(|e| {
            warn!(message = "initial status poll failed", error = %e);
        })
    }

    /// Poll forever at the configured interval. The first tick is one interval from now.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                warn!(message = "status poll failed, keeping previous values", error = %e);
            }
        }
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PollStatus> {
        self.status.subscribe()
    }

    pub fn last_update_success(&self) -> bool {
        self.status.borrow().last_update_success
    }

    pub fn last_error(&self) -> Option<UpdateFailed> {
        self.status.borrow().last_error.clone()
    }

    pub fn last_success(&self) -> Option<jiff::Timestamp> {
        self.status.borrow().last_success
    }
}
