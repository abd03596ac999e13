//! Publishes the washer sensors as a Homie 5 device.
//!
//! The device has a single `status` node with one retained property per sensor. Property values
//! are only re-sent when their rendered value changes. The outcome of the most recent poll is
//! reported through the `available` and `last-error` properties of the same node, while the
//! device `$state` stays `ready` for as long as the publisher runs.

use crate::coordinator::{PollCoordinator, PollStatus};
use crate::integration::Integration;
use crate::protocol::StatusSnapshot;
use crate::sensor::{Fallback, ReadingValue, Render, SensorDescription, SensorEntity};
use futures::StreamExt as _;
use homie5::client::{Publish, QoS, Subscription};
use homie5::device_description::{
    HomieDeviceDescription, HomieNodeDescription, HomiePropertyDescription, HomiePropertyFormat,
    PropertyDescriptionBuilder,
};
use homie5::{Homie5DeviceProtocol, HomieDataType, HomieDeviceStatus, HomieID};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

static STATUS_NODE: HomieID = HomieID::new_const("status");

static AVAILABLE: HomieID = HomieID::new_const("available");
static LAST_ERROR: HomieID = HomieID::new_const("last-error");

static PROPERTY_IDS: [(&str, HomieID); 16] = [
    ("mode", HomieID::new_const("mode")),
    ("state", HomieID::new_const("state")),
    ("countdown", HomieID::new_const("countdown")),
    ("washing_left", HomieID::new_const("washing-left")),
    ("error", HomieID::new_const("error")),
    ("times_after_clean", HomieID::new_const("times-after-clean")),
    ("detergent_empty", HomieID::new_const("detergent-empty")),
    ("softener_empty", HomieID::new_const("softener-empty")),
    ("program", HomieID::new_const("program")),
    ("temp", HomieID::new_const("temperature")),
    ("rinse_times", HomieID::new_const("rinse-times")),
    ("spin_level", HomieID::new_const("spin-level")),
    ("drying_mode", HomieID::new_const("drying-mode")),
    ("detergent_type", HomieID::new_const("detergent-type")),
    ("softener_type", HomieID::new_const("softener-type")),
    ("sound_set", HomieID::new_const("sound-set")),
];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sensor `{0}` has no Homie property id")]
    UnmappedSensor(&'static str),
    #[error("could not produce the Homie device messages")]
    Protocol(#[source] homie5::Homie5ProtocolError),
    #[error("could not publish to the MQTT broker")]
    Publish(#[source] rumqttc::v5::ClientError),
    #[error("the poll coordinator has shut down")]
    CoordinatorGone,
}

fn property_id(sensor: &SensorDescription) -> Result<&'static HomieID, Error> {
    PROPERTY_IDS
        .iter()
        .find(|(suffix, _)| *suffix == sensor.suffix)
        .map(|(_, id)| id)
        .ok_or(Error::UnmappedSensor(sensor.suffix))
}

pub(crate) fn property_description(sensor: &SensorDescription) -> HomiePropertyDescription {
    let builder = match sensor.render {
        Render::Passthrough { default: Fallback::Unknown } => {
            PropertyDescriptionBuilder::new(HomieDataType::String)
        }
        Render::Passthrough { default: Fallback::Zero } => {
            PropertyDescriptionBuilder::new(HomieDataType::Integer)
        }
        Render::Flag => PropertyDescriptionBuilder::new(HomieDataType::Boolean),
        Render::Enumerated { entries, .. } => PropertyDescriptionBuilder::new(HomieDataType::Enum)
            .format(HomiePropertyFormat::Enum(
                entries().into_iter().map(|(_, name)| name.to_string()).collect(),
            )),
    };
    let builder = builder.name(sensor.name);
    match sensor.unit {
        Some(_) => builder.unit(homie5::HOMIE_UNIT_DEGREE_CELSIUS).build(),
        None => builder.build(),
    }
}

/// The poll outcome properties, next to the sensor properties on the `status` node.
pub(crate) fn poll_status_properties() -> [(HomieID, HomiePropertyDescription); 2] {
    [
        (
            AVAILABLE.clone(),
            PropertyDescriptionBuilder::new(HomieDataType::Boolean).name("Available").build(),
        ),
        (
            LAST_ERROR.clone(),
            PropertyDescriptionBuilder::new(HomieDataType::String).name("Last poll error").build(),
        ),
    ]
}

/// The poll outcome property values that differ from what was last published.
pub(crate) fn changed_poll_status(
    status: &PollStatus,
    published: &mut BTreeMap<HomieID, String>,
) -> Vec<(HomieID, String)> {
    let values = [
        (&AVAILABLE, status.last_update_success.to_string()),
        (&LAST_ERROR, status.last_error.as_ref().map(|e| e.0.clone()).unwrap_or_default()),
    ];
    let mut changes = Vec::new();
    for (prop_id, value) in values {
        if published.get(prop_id) == Some(&value) {
            continue;
        }
        published.insert(prop_id.clone(), value.clone());
        changes.push((prop_id.clone(), value));
    }
    changes
}

/// Render every property from `snapshot` and return the ones whose value differs from what was
/// last published. Sensors that fail to decode are skipped for this round.
pub(crate) fn changed_values<'a>(
    properties: impl IntoIterator<Item = (&'a HomieID, &'a SensorDescription)>,
    snapshot: &StatusSnapshot,
    published: &mut BTreeMap<HomieID, String>,
) -> Vec<(HomieID, String)> {
    let mut changes = Vec::new();
    for (prop_id, sensor) in properties {
        let integer = matches!(sensor.render, Render::Passthrough { default: Fallback::Zero });
        let value = match sensor.render(snapshot) {
            Ok(value) if integer && !matches!(value, ReadingValue::Integer(_)) => {
                warn!(
                    message = "sensor value is not an integer, not publishing it",
                    sensor = sensor.name,
                    %value
                );
                continue;
            }
            Ok(value) => value.to_string(),
            Err(e) => {
                warn!(
                    message = "could not decode sensor value, not publishing it",
                    sensor = sensor.name,
                    error = (&e as &dyn std::error::Error)
                );
                continue;
            }
        };
        if published.get(prop_id) == Some(&value) {
            continue;
        }
        published.insert(prop_id.clone(), value.clone());
        changes.push((prop_id.clone(), value));
    }
    changes
}

pub fn device_description(sensors: &[SensorEntity]) -> Result<HomieDeviceDescription, Error> {
    let mut properties = sensors
        .iter()
        .map(|s| Ok((property_id(s.description())?.clone(), property_description(s.description()))))
        .collect::<Result<BTreeMap<_, _>, Error>>()?;
    properties.extend(poll_status_properties());
    let node = HomieNodeDescription {
        name: Some("washer status".to_string()),
        r#type: None,
        properties,
    };
    Ok(homie5::device_description::DeviceDescriptionBuilder::new()
        .name("Zeo One")
        .add_node(STATUS_NODE.clone(), node)
        .build())
}

pub struct ZeoOneDevice {
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    state: HomieDeviceStatus,
    description: HomieDeviceDescription,
    properties: Vec<(HomieID, SensorEntity)>,
    published: BTreeMap<HomieID, String>,
    coordinator: Arc<PollCoordinator>,
    snapshots: WatchStream<Arc<StatusSnapshot>>,
    status: WatchStream<PollStatus>,
}

impl ZeoOneDevice {
    pub fn new(
        mqtt: rumqttc::v5::AsyncClient,
        protocol: Homie5DeviceProtocol,
        integration: &Integration,
    ) -> Result<Self, Error> {
        let sensors = integration.sensors();
        let description = device_description(&sensors)?;
        let properties = sensors
            .into_iter()
            .map(|s| Ok((property_id(s.description())?.clone(), s)))
            .collect::<Result<Vec<_>, Error>>()?;
        let coordinator = Arc::clone(integration.coordinator());
        Ok(Self {
            mqtt,
            protocol,
            state: HomieDeviceStatus::Init,
            description,
            properties,
            published: BTreeMap::new(),
            snapshots: WatchStream::from_changes(coordinator.subscribe()),
            status: WatchStream::from_changes(coordinator.subscribe_status()),
            coordinator,
        })
    }

    pub async fn publish_device(&mut self) -> Result<(), Error> {
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    self.publish_state(HomieDeviceStatus::Init).await?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&self.description)
                        .map_err(Error::Protocol)?;
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    self.publish_changed_values().await?;
                    let status = self.coordinator.subscribe_status().borrow().clone();
                    self.publish_poll_status(&status).await?;
                    // Let the property publishes go out before `$state` flips to ready.
                    tokio::task::yield_now().await;
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    // All properties are read-only, so there is usually nothing to subscribe to.
                    // An empty subscription makes the event loop report `EmptySubscription`.
                    let mut p = self
                        .protocol
                        .subscribe_props(&self.description)
                        .map_err(Error::Protocol)?
                        .peekable();
                    if p.peek().is_some() {
                        self.mqtt.homie_subscribe(p).await.map_err(Error::Publish)?;
                    }
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    debug!("device becomes ready...");
                    self.publish_state(HomieDeviceStatus::Ready).await?;
                }
            }
        }
        Ok(())
    }

    async fn publish_state(&mut self, state: HomieDeviceStatus) -> Result<(), Error> {
        if state != self.state {
            info!(message = "device state changes", from = ?self.state, to = ?state);
        }
        self.state = state;
        let p = self.protocol.publish_state(self.state);
        self.mqtt.homie_publish(p).await.map_err(Error::Publish)
    }

    async fn publish_changed_values(&mut self) -> Result<(), Error> {
        // One snapshot for the whole round, so all properties reflect the same poll.
        let snapshot = self.coordinator.snapshot();
        let properties = self.properties.iter().map(|(id, s)| (id, s.description()));
        let changes = changed_values(properties, &snapshot, &mut self.published);
        debug!(message = "publishing property values", count = changes.len());
        self.publish_values(changes).await
    }

    async fn publish_poll_status(&mut self, status: &PollStatus) -> Result<(), Error> {
        let changes = changed_poll_status(status, &mut self.published);
        if !status.last_update_success {
            debug!(message = "reporting failed poll", error = ?status.last_error);
        }
        self.publish_values(changes).await
    }

    async fn publish_values(&mut self, changes: Vec<(HomieID, String)>) -> Result<(), Error> {
        for (prop_id, value) in changes {
            let retained = self
                .description
                .get_property_by_id(&STATUS_NODE, &prop_id)
                .map(|pd| pd.retained)
                .unwrap_or(true);
            let msg = self.protocol.publish_value(&STATUS_NODE, &prop_id, value, retained);
            self.mqtt.homie_publish(msg).await.map_err(Error::Publish)?;
        }
        Ok(())
    }

    /// Follow the coordinator until it shuts down.
    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            tokio::select! {
                snapshot = self.snapshots.next() => {
                    if snapshot.is_none() {
                        return Err(Error::CoordinatorGone);
                    }
                    self.publish_changed_values().await?;
                }
                status = self.status.next() => {
                    let Some(status) = status else {
                        return Err(Error::CoordinatorGone);
                    };
                    self.publish_poll_status(&status).await?;
                }
            }
        }
    }

    /// Mark the device as disconnected on the way out.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        self.publish_state(HomieDeviceStatus::Disconnected).await
    }
}

trait MqttClientExt {
    type PublishError;
    type SubscribeError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError>;
    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    type SubscribeError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload).await
    }

    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError> {
        self.subscribe_many(
            subs.map(|sub| rumqttc::v5::mqttbytes::v5::Filter::new(sub.topic, convert_qos(sub.qos))),
        )
        .await
    }
}

pub fn convert_qos(homie: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match homie {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}
