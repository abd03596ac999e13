// End-to-end tests of integration setup, polling and sensors with fake cloud and device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use secrecy::SecretString;
use zeo_one_tools::cloud::{self, CloudApi, Device, HomeData, Product, Rriot, RriotReference, UserData};
use zeo_one_tools::coordinator;
use zeo_one_tools::credentials::Credentials;
use zeo_one_tools::integration::{Integration, SetupError};
use zeo_one_tools::protocol::{FieldValue, StatusSnapshot, ZeoField};
use zeo_one_tools::sensor::ReadingValue;
use zeo_one_tools::session::{self, DeviceHandle};
use zeo_one_tools::status_client::{self, StatusClient};

// ── Fakes ───────────────────────────────────────────────────────────

struct FakeCloud {
    home: HomeData,
}

impl FakeCloud {
    fn with_devices(names: &[&str]) -> Self {
        let devices = names
            .iter()
            .enumerate()
            .map(|(i, name)| Device {
                duid: format!("duid-{i}"),
                name: name.to_string(),
                local_key: "0123456789abcdef".into(),
                ..Default::default()
            })
            .collect();
        let products = vec![Product {
            id: "p1".into(),
            name: "H1".into(),
            model: "roborock.wm.h1".into(),
            category: "roborock.wm".into(),
        }];
        Self { home: HomeData { id: 1, name: "home".into(), products, devices } }
    }
}

impl CloudApi for FakeCloud {
    fn login<'a>(&'a self, _: &'a SecretString) -> BoxFuture<'a, Result<UserData, cloud::Error>> {
        Box::pin(async {
            Ok(UserData {
                uid: Some(1),
                token: "token".into(),
                region: None,
                country: None,
                nickname: None,
                rriot: Rriot {
                    u: "u".into(),
                    s: "s".into(),
                    h: "h".into(),
                    k: "k".into(),
                    r: RriotReference {
                        r: "EU".into(),
                        a: "https://api.invalid".into(),
                        m: "ssl://mqtt.invalid:8883".into(),
                        l: String::new(),
                    },
                },
            })
        })
    }

    fn home_data<'a>(&'a self, _: &'a UserData) -> BoxFuture<'a, Result<HomeData, cloud::Error>> {
        Box::pin(async { Ok(self.home.clone()) })
    }
}

enum Step {
    Answer(StatusSnapshot),
    Fail,
    Hang,
}

#[derive(Default)]
struct FakeWasher {
    polls: AtomicUsize,
    closed: AtomicBool,
    script: Mutex<VecDeque<Step>>,
}

impl FakeWasher {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(steps.into_iter().collect()), ..Default::default() })
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl StatusClient for FakeWasher {
    fn update_values<'a>(
        &'a self,
        _: &'a [ZeoField],
    ) -> BoxFuture<'a, Result<StatusSnapshot, status_client::Error>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match step {
                Some(Step::Answer(snapshot)) => Ok(snapshot),
                Some(Step::Fail) | None => Err(status_client::Error::NoResponse(16)),
                Some(Step::Hang) => futures::future::pending().await,
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async {})
    }
}

fn credentials() -> Credentials {
    Credentials::new("washer@example.com".into(), "eu".into(), "pw".to_string().into())
}

fn running(countdown: i64) -> StatusSnapshot {
    [
        (ZeoField::Mode, FieldValue::Integer(2)),
        (ZeoField::State, FieldValue::Integer(1)),
        (ZeoField::Error, FieldValue::Integer(0)),
        (ZeoField::Countdown, FieldValue::Integer(countdown)),
    ]
    .into_iter()
    .collect()
}

async fn set_up(
    cloud: &FakeCloud,
    washer: &Arc<FakeWasher>,
) -> Result<Integration, SetupError> {
    let washer = Arc::clone(washer);
    Integration::setup(
        "entry",
        &credentials(),
        cloud,
        move |_: &DeviceHandle| Ok(washer as Arc<dyn StatusClient>),
        &coordinator::Args::default(),
    )
    .await
}

fn reading(integration: &Integration, unique_id: &str) -> ReadingValue {
    let sensors = integration.sensors();
    let sensor = sensors.iter().find(|s| s.unique_id() == unique_id).unwrap();
    sensor.value().unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn missing_washer_fails_setup_without_connecting() {
    let cloud = FakeCloud::with_devices(&["S7", "Q5"]);
    let connected = AtomicBool::new(false);
    let result = Integration::setup(
        "entry",
        &credentials(),
        &cloud,
        |_: &DeviceHandle| {
            connected.store(true, Ordering::SeqCst);
            Ok(FakeWasher::new([]) as Arc<dyn StatusClient>)
        },
        &coordinator::Args::default(),
    )
    .await;
    assert!(matches!(
        result,
        Err(SetupError::Session(session::Error::DeviceNotFound(_)))
    ));
    assert!(!connected.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn failed_first_poll_is_not_ready() {
    let cloud = FakeCloud::with_devices(&["H1"]);
    let washer = FakeWasher::new([Step::Fail]);
    let result = set_up(&cloud, &washer).await;
    assert!(matches!(result, Err(SetupError::NotReady(_))));
    assert!(washer.closed.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(washer.polls(), 1);
}

#[tokio::test(start_paused = true)]
async fn sensors_read_the_polled_snapshot() {
    let cloud = FakeCloud::with_devices(&["S7", "H1 Neo"]);
    let washer = FakeWasher::new([Step::Answer(running(30))]);
    let integration = set_up(&cloud, &washer).await.unwrap();

    assert_eq!(integration.device().duid(), "duid-1");
    assert_eq!(integration.sensors().len(), 16);
    assert_eq!(reading(&integration, "entry_mode"), ReadingValue::Integer(2));
    assert_eq!(reading(&integration, "entry_state"), ReadingValue::Integer(1));
    assert_eq!(reading(&integration, "entry_error"), ReadingValue::Symbol("none"));
    assert_eq!(reading(&integration, "entry_countdown"), ReadingValue::Integer(30));
    assert_eq!(reading(&integration, "entry_washing_left"), ReadingValue::Integer(0));
    assert_eq!(reading(&integration, "entry_sound_set"), ReadingValue::Boolean(false));

    integration.unload().await;
    assert!(washer.closed.load(Ordering::SeqCst));

    // Unloading stops the periodic poll.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(washer.polls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_polls_keep_the_last_snapshot() {
    let cloud = FakeCloud::with_devices(&["H1"]);
    let washer = FakeWasher::new([
        Step::Answer(running(30)),
        Step::Fail,
        Step::Hang,
        Step::Answer(running(28)),
    ]);
    let integration = set_up(&cloud, &washer).await.unwrap();
    let sensors = integration.sensors();
    let countdown = sensors.iter().find(|s| s.unique_id() == "entry_countdown").unwrap();

    // Transport failure on the first periodic poll.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(washer.polls(), 2);
    assert_eq!(countdown.value(), Ok(ReadingValue::Integer(30)));
    assert!(!countdown.available());

    // Second periodic poll never answers and is cut off by the timeout.
    tokio::time::sleep(Duration::from_secs(60 + 40)).await;
    assert_eq!(washer.polls(), 3);
    assert_eq!(countdown.value(), Ok(ReadingValue::Integer(30)));
    assert!(integration.coordinator().last_error().unwrap().0.contains("timed out"));

    // Recovery.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(washer.polls(), 4);
    assert_eq!(countdown.value(), Ok(ReadingValue::Integer(28)));
    assert!(countdown.available());

    integration.unload().await;
}
