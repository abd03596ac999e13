//! One configured washer: session, status client, poll coordinator and sensors.
//!
//! There is no process-wide registry. Whoever calls [`Integration::setup`] owns the returned
//! value, and sensors get their coordinator reference from it directly.

use crate::cloud::CloudApi;
use crate::coordinator::{self, PollCoordinator, UpdateFailed};
use crate::credentials::Credentials;
use crate::sensor::SensorEntity;
use crate::session::{self, DeviceHandle};
use crate::status_client::{self, StatusClient};
use std::sync::Arc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info};

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("could not establish the vendor cloud session")]
    Session(#[source] session::Error),
    #[error("could not connect to the washer")]
    Connect(#[source] status_client::Error),
    #[error("the washer is not ready")]
    NotReady(#[source] UpdateFailed),
}

pub struct Integration {
    entry_id: String,
    device: DeviceHandle,
    client: Arc<dyn StatusClient>,
    coordinator: Arc<PollCoordinator>,
    poll_task: AbortOnDropHandle<()>,
}

impl Integration {
    /// Bring up the integration for one config entry.
    ///
    /// Nothing is connected or scheduled unless the session could be established, and the
    /// periodic poll only starts once a first poll has succeeded.
    pub async fn setup<F>(
        entry_id: &str,
        credentials: &Credentials,
        cloud: &(impl CloudApi + ?Sized),
        connect: F,
        args: &coordinator::Args,
    ) -> Result<Self, SetupError>
    where
        F: FnOnce(&DeviceHandle) -> Result<Arc<dyn StatusClient>, status_client::Error>,
    {
        debug!(message = "setting up", entry_id, ?credentials);
        let device = session::establish(cloud, credentials).await.map_err(SetupError::Session)?;
        let client = connect(&device).map_err(SetupError::Connect)?;
        let coordinator = Arc::new(PollCoordinator::new(Arc::clone(&client), args));
        if let Err(e) = coordinator.first_refresh().await {
            client.close().await;
            return Err(SetupError::NotReady(e));
        }
        let runner = Arc::clone(&coordinator);
        let poll_task = AbortOnDropHandle::new(tokio::spawn(async move { runner.run().await }));
        info!(
            message = "washer is set up",
            entry_id,
            duid = device.duid(),
            interval = %humantime::format_duration(coordinator.interval())
        );
        Ok(Self { entry_id: entry_id.to_string(), device, client, coordinator, poll_task })
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn coordinator(&self) -> &Arc<PollCoordinator> {
        &self.coordinator
    }

    pub fn sensors(&self) -> Vec<SensorEntity> {
        SensorEntity::all(&self.entry_id, &self.coordinator)
    }

    /// Stop polling and close the device session.
    pub async fn unload(self) {
        self.poll_task.abort();
        self.client.close().await;
        info!(message = "washer unloaded", entry_id = %self.entry_id);
    }
}
