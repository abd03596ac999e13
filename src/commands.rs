pub mod setup {
    use crate::cloud::{self, CloudClient};
    use crate::integration::{Integration, SetupError};
    use crate::session::DeviceHandle;
    use crate::status_client::{self, MqttStatusClient, StatusClient};
    use crate::{coordinator, credentials};
    use std::sync::Arc;

    /// Everything needed to bring up one washer integration.
    #[derive(clap::Parser, Clone)]
    #[group(id = "setup::Args")]
    pub struct Args {
        #[clap(flatten)]
        credentials: credentials::Args,
        #[clap(flatten)]
        status_client: status_client::Args,
        #[clap(flatten)]
        coordinator: coordinator::Args,
        /// Integration instance id. Sensor unique ids are derived from it.
        #[arg(long, default_value = "zeo_one")]
        entry_id: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not create the vendor cloud client")]
        Cloud(#[source] cloud::Error),
        #[error("could not set up the washer integration")]
        Setup(#[source] SetupError),
    }

    impl Args {
        pub async fn setup(self) -> Result<Integration, Error> {
            let credentials = self.credentials.into_credentials();
            let cloud = CloudClient::new(&credentials).map_err(Error::Cloud)?;
            let status_args = self.status_client;
            let connect = |device: &DeviceHandle| {
                MqttStatusClient::connect(device, &status_args)
                    .map(|client| Arc::new(client) as Arc<dyn StatusClient>)
            };
            Integration::setup(&self.entry_id, &credentials, &cloud, connect, &self.coordinator)
                .await
                .map_err(Error::Setup)
        }
    }

    pub(crate) fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()
    }
}

pub mod read {
    use crate::codes::DecodeError;
    use crate::output;
    use crate::sensor::ReadingValue;

    /// Poll the washer once and print every sensor reading.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        setup: super::setup::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Setup(super::setup::Error),
        #[error("could not output the readings")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Reading {
        unique_id: String,
        name: &'static str,
        value: Option<ReadingValue>,
        unit: Option<&'static str>,
        error: Option<String>,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::setup::runtime().map_err(Error::Runtime)?;
        runtime.block_on(async move {
            let integration = args.setup.setup().await.map_err(Error::Setup)?;
            let result = print(&integration.sensors(), args.output);
            integration.unload().await;
            result
        })
    }

    fn print(sensors: &[crate::sensor::SensorEntity], args: output::Args) -> Result<(), Error> {
        let mut output = args.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec!["Sensor", "Unique ID", "Value", "Unit"])
            .map_err(Error::Output)?;
        for sensor in sensors {
            let value: Result<ReadingValue, DecodeError> = sensor.value();
            output
                .result(
                    || {
                        vec![
                            sensor.name().to_string(),
                            sensor.unique_id(),
                            match &value {
                                Ok(v) => v.to_string(),
                                Err(e) => format!("<{e}>"),
                            },
                            sensor.unit().unwrap_or_default().to_string(),
                        ]
                    },
                    || Reading {
                        unique_id: sensor.unique_id(),
                        name: sensor.name(),
                        value: value.clone().ok(),
                        unit: sensor.unit(),
                        error: value.as_ref().err().map(|e| e.to_string()),
                    },
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod homie {
    use crate::homie::{self, ZeoOneDevice, convert_qos};
    use homie5::{Homie5DeviceProtocol, HomieDomain, HomieID};
    use std::time::Duration;
    use tokio_util::task::AbortOnDropHandle;
    use tracing::{info, trace, warn};

    /// Keep polling the washer and publish its sensors as a Homie 5 device.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        setup: super::setup::Args,
        /// MQTT broker the Homie device is published to.
        ///
        /// The URL must carry a `client_id` query parameter.
        #[arg(long, default_value = "mqtt://localhost:1883?client_id=zeo-one-tools")]
        mqtt_broker: String,
        /// Homie device id.
        #[arg(long, default_value = "zeo-one")]
        device_id: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Setup(super::setup::Error),
        #[error("`{0}` is not a valid Homie device id")]
        DeviceId(String),
        #[error("MQTT broker URL is not valid")]
        BrokerUrl(#[source] rumqttc::v5::OptionError),
        #[error("could not publish the Homie device")]
        Homie(#[source] homie::Error),
        #[error("could not wait for the interrupt signal")]
        Signal(#[source] std::io::Error),
    }

    fn broker_options(url: &str) -> Result<rumqttc::v5::MqttOptions, Error> {
        rumqttc::v5::MqttOptions::parse_url(url).map_err(Error::BrokerUrl)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::setup::runtime().map_err(Error::Runtime)?;
        runtime.block_on(async move {
            let device_id = HomieID::try_from(args.device_id.clone())
                .map_err(|_| Error::DeviceId(args.device_id.clone()))?;
            let mut options = broker_options(&args.mqtt_broker)?;
            let integration = args.setup.setup().await.map_err(Error::Setup)?;

            let (protocol, last_will) = Homie5DeviceProtocol::new(device_id, HomieDomain::Default);
            options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
                last_will.topic,
                last_will.message,
                convert_qos(last_will.qos),
                last_will.retain,
                None,
            ));
            let (mqtt, mut eventloop) = rumqttc::v5::AsyncClient::new(options, 100);
            let _mqtt_loop = AbortOnDropHandle::new(tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(event) => trace!(?event, "homie broker event"),
                        Err(e) => {
                            warn!(
                                message = "homie broker connection failed, will reconnect",
                                error = (&e as &dyn std::error::Error)
                            );
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }));

            let mut device =
                ZeoOneDevice::new(mqtt, protocol, &integration).map_err(Error::Homie)?;
            let result = async {
                device.publish_device().await.map_err(Error::Homie)?;
                tokio::select! {
                    result = device.run() => result.map_err(Error::Homie),
                    signal = tokio::signal::ctrl_c() => {
                        info!("interrupted, shutting down");
                        signal.map_err(Error::Signal)
                    }
                }
            }
            .await;
            if let Err(e) = device.disconnect().await {
                warn!(message = "could not mark the device disconnected", error = %e);
            }
            integration.unload().await;
            result
        })
    }

}

pub mod fields {
    use crate::codes;
    use crate::output;
    use crate::sensor::{Fallback, Render, SENSORS};

    /// List the sensors, the data points they read and the code tables they use.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only show sensors whose name or field contains this text.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the sensor list")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct FieldSchema {
        suffix: &'static str,
        name: &'static str,
        field: &'static str,
        data_point: u32,
        rendering: &'static str,
        unit: Option<&'static str>,
        table: Option<&'static str>,
        codes: Vec<(i64, &'static str)>,
    }

    fn is_match(schema: &FieldSchema, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        schema.name.to_uppercase().contains(&pattern)
            || schema.field.contains(&pattern)
            || schema.data_point.to_string().contains(&pattern)
    }

    fn schemas() -> impl Iterator<Item = FieldSchema> {
        SENSORS.iter().map(|sensor| {
            let (table, codes) = match codes::table_for(sensor.field) {
                Some((table, codes)) => (Some(table), codes),
                None => (None, Vec::new()),
            };
            FieldSchema {
                suffix: sensor.suffix,
                name: sensor.name,
                field: sensor.field.name(),
                data_point: sensor.field.id(),
                rendering: match sensor.render {
                    Render::Passthrough { default: Fallback::Unknown } => "raw, else \"unknown\"",
                    Render::Passthrough { default: Fallback::Zero } => "raw, else 0",
                    Render::Flag => "flag, else false",
                    Render::Enumerated { .. } => "code name",
                },
                unit: sensor.unit,
                table,
                codes,
            }
        })
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec!["Data point", "Field", "Sensor", "Rendering", "Unit", "Codes"])
            .map_err(Error::Output)?;
        for schema in schemas() {
            if let Some(pattern) = &args.filter {
                if !is_match(&schema, pattern) {
                    continue;
                }
            }
            output
                .result(
                    || {
                        vec![
                            schema.data_point.to_string(),
                            schema.field.to_string(),
                            schema.name.to_string(),
                            schema.rendering.to_string(),
                            schema.unit.unwrap_or_default().to_string(),
                            schema
                                .codes
                                .iter()
                                .map(|(code, name)| format!("{code}={name}"))
                                .collect::<Vec<_>>()
                                .join(", "),
                        ]
                    },
                    || &schema,
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

}
