use crate::a01::{self, A01Codec, Message};
use crate::protocol::{StatusSnapshot, ZeoField};
use crate::session::DeviceHandle;
use futures::future::BoxFuture;
use md5::Digest as _;
use rand::Rng as _;
use rumqttc::{ConnectionError, Event, Packet, QoS};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder as _, Encoder as _};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("device broker URL `{0}` is not usable")]
    BrokerUrl(String),
    #[error("could not set up the device message codec")]
    Codec(#[source] a01::Error),
    #[error("could not encode the status request")]
    Encode(#[source] std::io::Error),
    #[error("could not publish the status request")]
    Publish(#[source] rumqttc::ClientError),
    #[error("the device session has been closed")]
    Closed,
    #[error("the device did not answer any of the {0} requested fields")]
    NoResponse(usize),
}

/// Fetches current values for a set of field keys from the washer.
pub trait StatusClient: Send + Sync {
    fn update_values<'a>(
        &'a self,
        fields: &'a [ZeoField],
    ) -> BoxFuture<'a, Result<StatusSnapshot, Error>>;

    /// Tear down the underlying session. Further requests fail.
    fn close(&self) -> BoxFuture<'_, ()>;
}

#[derive(clap::Parser, Clone)]
#[group(id = "status_client::Args")]
pub struct Args {
    /// How long to collect data point responses after sending a status request.
    ///
    /// Fields the device has not reported by then are left out of the snapshot.
    #[arg(long, default_value = "4s")]
    response_window: humantime::Duration,

    /// MQTT keep-alive interval for the session with the vendor broker. At least one second.
    #[arg(long, default_value = "60s", value_parser = parse_keep_alive)]
    broker_keep_alive: humantime::Duration,
}

fn parse_keep_alive(value: &str) -> Result<humantime::Duration, String> {
    let duration = value.parse::<humantime::Duration>().map_err(|e| e.to_string())?;
    if *duration < Duration::from_secs(1) {
        return Err("the keep-alive interval must be at least 1s".to_string());
    }
    Ok(duration)
}

impl Default for Args {
    fn default() -> Self {
        Self {
            response_window: Duration::from_secs(4).into(),
            broker_keep_alive: Duration::from_secs(60).into(),
        }
    }
}

pub(crate) fn md5hex(input: &str) -> String {
    format!("{:x}", md5::Md5::digest(input.as_bytes()))
}

/// Broker username and password derived from the account's IoT credentials.
pub(crate) fn broker_credentials(u: &str, s: &str, k: &str) -> (String, String) {
    let user = md5hex(&format!("{u}:{k}"))[2..10].to_string();
    let password = md5hex(&format!("{s}:{k}"))[16..].to_string();
    (user, password)
}

/// The latest data point values reported by the device.
#[derive(Default)]
pub(crate) struct DataPointTracker {
    values: Mutex<BTreeMap<u32, serde_json::Value>>,
    change_notify: Notify,
}

impl DataPointTracker {
    pub(crate) fn forget(&self, ids: &[u32]) {
        let mut guard = self.values.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            guard.remove(id);
        }
    }

    pub(crate) fn record(&self, points: impl IntoIterator<Item = (u32, serde_json::Value)>) {
        let mut guard = self.values.lock().unwrap_or_else(|e| e.into_inner());
        guard.extend(points);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    /// Wait until all of `ids` have a value or `deadline` passes, whichever is first.
    pub(crate) async fn wait_for(
        &self,
        ids: &[u32],
        deadline: Instant,
    ) -> BTreeMap<u32, serde_json::Value> {
        loop {
            let mut notified = std::pin::pin!(self.change_notify.notified());
            notified.as_mut().enable();
            {
                let guard = self.values.lock().unwrap_or_else(|e| e.into_inner());
                if ids.iter().all(|id| guard.contains_key(id)) {
                    break;
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        let guard = self.values.lock().unwrap_or_else(|e| e.into_inner());
        ids.iter().filter_map(|id| Some((*id, guard.get(id)?.clone()))).collect()
    }
}

/// Status client speaking A01 over the vendor's MQTT broker.
pub struct MqttStatusClient {
    mqtt: rumqttc::AsyncClient,
    codec: A01Codec,
    publish_topic: String,
    tracker: Arc<DataPointTracker>,
    seq: AtomicU32,
    response_window: Duration,
    subscribed: watch::Receiver<bool>,
    worker: AbortOnDropHandle<()>,
}

impl MqttStatusClient {
    pub fn connect(handle: &DeviceHandle, args: &Args) -> Result<Self, Error> {
        let rriot = &handle.user.rriot;
        let url = reqwest::Url::parse(&rriot.r.m).map_err(|_| Error::BrokerUrl(rriot.r.m.clone()))?;
        let host = url.host_str().ok_or_else(|| Error::BrokerUrl(rriot.r.m.clone()))?;
        let port = url.port().unwrap_or(8883);
        let codec = A01Codec::new(&handle.device.local_key).map_err(Error::Codec)?;
        let (user, password) = broker_credentials(&rriot.u, &rriot.s, &rriot.k);
        let subscribe_topic = format!("rr/m/o/{}/{user}/{}", rriot.u, handle.duid());
        let publish_topic = format!("rr/m/i/{}/{user}/{}", rriot.u, handle.duid());

        let client_id = format!("zeo-one-tools-{:08x}", rand::thread_rng().r#gen::<u32>());
        let mut options = rumqttc::MqttOptions::new(client_id, host, port);
        options.set_credentials(user, password);
        options.set_keep_alive(*args.broker_keep_alive);
        if url.scheme() == "ssl" || url.scheme() == "mqtts" {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        info!(message = "connecting to the device broker", host, port, duid = handle.duid());
        let (mqtt, eventloop) = rumqttc::AsyncClient::new(options, 16);
        let tracker = Arc::new(DataPointTracker::default());
        let (subscribed_tx, subscribed) = watch::channel(false);
        let worker = Worker {
            mqtt: mqtt.clone(),
            codec: codec.clone(),
            subscribe_topic,
            tracker: Arc::clone(&tracker),
            subscribed: subscribed_tx,
        }
        .spawn(eventloop);
        Ok(Self {
            mqtt,
            codec,
            publish_topic,
            tracker,
            seq: AtomicU32::new(rand::thread_rng().gen_range(100_000..1_000_000)),
            response_window: *args.response_window,
            subscribed,
            worker,
        })
    }

    /// Ask the device for `fields` and collect whatever it reports within the response window.
    ///
    /// Responses carry no request id, so data points that arrive after [`DataPointTracker::forget`]
    /// are attributed to this request even if the device sent them for an earlier, abandoned one.
    /// They are still the device's current values, so this only affects which poll sees them.
    async fn request(&self, fields: &[ZeoField]) -> Result<StatusSnapshot, Error> {
        if self.worker.is_finished() {
            return Err(Error::Closed);
        }
        // Anything published before the response topic subscription is acknowledged would have
        // its answer dropped by the broker.
        self.subscribed.clone().wait_for(|s| *s).await.map_err(|_| Error::Closed)?;
        let ids = fields.iter().map(|f| f.id()).collect::<Vec<_>>();
        self.tracker.forget(&ids);
        let msg = Message::query(
            self.seq.fetch_add(1, Ordering::Relaxed),
            rand::thread_rng().gen_range(10_000..100_000),
            jiff::Timestamp::now().as_second() as u32,
            ids.iter().copied(),
        );
        let mut frame = BytesMut::new();
        self.codec.clone().encode(&msg, &mut frame).map_err(Error::Encode)?;
        self.mqtt
            .publish(&self.publish_topic, QoS::AtMostOnce, false, frame.to_vec())
            .await
            .map_err(Error::Publish)?;
        let deadline = Instant::now() + self.response_window;
        let points = self.tracker.wait_for(&ids, deadline).await;
        debug!(message = "status request answered", requested = ids.len(), answered = points.len());
        if points.is_empty() {
            return Err(Error::NoResponse(ids.len()));
        }
        Ok(StatusSnapshot::from_data_points(points.iter().map(|(k, v)| (*k, v))))
    }
}

impl StatusClient for MqttStatusClient {
    fn update_values<'a>(
        &'a self,
        fields: &'a [ZeoField],
    ) -> BoxFuture<'a, Result<StatusSnapshot, Error>> {
        Box::pin(self.request(fields))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.mqtt.disconnect().await {
                debug!(message = "disconnect request was not delivered", error = %e);
            }
            self.worker.abort();
            info!("device session closed");
        })
    }
}

struct Worker {
    mqtt: rumqttc::AsyncClient,
    codec: A01Codec,
    subscribe_topic: String,
    tracker: Arc<DataPointTracker>,
    subscribed: watch::Sender<bool>,
}

impl Worker {
    fn spawn(self, eventloop: rumqttc::EventLoop) -> AbortOnDropHandle<()> {
        AbortOnDropHandle::new(tokio::task::spawn(self.main_loop(eventloop)))
    }

    async fn main_loop(mut self, mut eventloop: rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(message = "connected to the device broker", code = ?ack.code);
                    self.subscribed.send_replace(false);
                    // Sessions are clean, so the subscription has to be renewed on every
                    // reconnect.
                    if let Err(e) = self.mqtt.try_subscribe(&self.subscribe_topic, QoS::AtMostOnce)
                    {
                        warn!(message = "could not subscribe to device responses", error = %e);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(message = "subscribed to device responses", pkid = ack.pkid);
                    self.subscribed.send_replace(true);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(&publish.payload);
                }
                Ok(event) => trace!(?event, "broker event"),
                Err(ConnectionError::RequestsDone) => return,
                Err(e) => {
                    self.subscribed.send_replace(false);
                    warn!(
                        message = "device broker connection failed, will reconnect",
                        error = (&e as &dyn std::error::Error)
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    fn handle_publish(&mut self, payload: &[u8]) {
        let mut buf = BytesMut::from(payload);
        loop {
            let msg = match self.codec.decode(&mut buf) {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    warn!(message = "could not decode device message", error = %e);
                    break;
                }
            };
            if msg.protocol != a01::RPC_RESPONSE {
                debug!(message = "ignoring device message", protocol = msg.protocol);
                continue;
            }
            let json = match serde_json::from_slice::<serde_json::Value>(&msg.payload) {
                Ok(json) => json,
                Err(e) => {
                    warn!(message = "device response is not JSON", error = %e);
                    continue;
                }
            };
            let Some(dps) = json.get("dps").and_then(|d| d.as_object()) else {
                debug!(message = "device response without data points", ?json);
                continue;
            };
            let points = dps
                .iter()
                .filter_map(|(k, v)| Some((k.parse::<u32>().ok()?, v.clone())))
                .collect::<Vec<_>>();
            trace!(message = "recording data points", count = points.len());
            self.tracker.record(points);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a01::RPC_RESPONSE;
    use crate::protocol::FieldValue;
    use serde_json::json;
    use tokio_util::codec::Encoder as _;

    const KEY: &str = "0123456789abcdef";

    fn frame(protocol: u16, payload: serde_json::Value, out: &mut BytesMut) {
        let msg = Message {
            seq: 1,
            random: 4242,
            timestamp: 1_700_000_000,
            protocol,
            payload: payload.to_string().into_bytes(),
        };
        A01Codec::new(KEY).unwrap().encode(&msg, out).unwrap();
    }

    /// A client and worker wired to each other but not to any broker, already subscribed. The
    /// event loop is returned so that publishes have somewhere to go.
    fn offline(response_window: Duration) -> (MqttStatusClient, Worker, rumqttc::EventLoop) {
        let options = rumqttc::MqttOptions::new("zeo-test", "localhost", 1883);
        let (mqtt, eventloop) = rumqttc::AsyncClient::new(options, 16);
        let codec = A01Codec::new(KEY).unwrap();
        let tracker = Arc::new(DataPointTracker::default());
        let (subscribed_tx, subscribed) = watch::channel(true);
        let worker = Worker {
            mqtt: mqtt.clone(),
            codec: codec.clone(),
            subscribe_topic: "rr/m/o/test".into(),
            tracker: Arc::clone(&tracker),
            subscribed: subscribed_tx,
        };
        let client = MqttStatusClient {
            mqtt,
            codec,
            publish_topic: "rr/m/i/test".into(),
            tracker,
            seq: AtomicU32::new(1),
            response_window,
            subscribed,
            worker: AbortOnDropHandle::new(tokio::spawn(std::future::pending())),
        };
        (client, worker, eventloop)
    }

    fn recorded(tracker: &DataPointTracker) -> BTreeMap<u32, serde_json::Value> {
        tracker.values.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn responses_in_one_payload_are_all_recorded() {
        let (_client, mut worker, _eventloop) = offline(Duration::from_secs(4));
        let mut payload = BytesMut::new();
        frame(999, json!({ "dps": { "204": 1 } }), &mut payload);
        frame(RPC_RESPONSE, json!({ "dps": { "203": 4, "220": 0, "226": true } }), &mut payload);
        frame(RPC_RESPONSE, json!({ "dps": { "217": 30, "bogus": 1 } }), &mut payload);
        worker.handle_publish(&payload);
        assert_eq!(
            recorded(&worker.tracker),
            BTreeMap::from([(203, json!(4)), (217, json!(30)), (220, json!(0)), (226, json!(true))])
        );
    }

    #[tokio::test]
    async fn corrupt_frame_stops_decoding() {
        let (_client, mut worker, _eventloop) = offline(Duration::from_secs(4));
        let mut payload = BytesMut::new();
        frame(RPC_RESPONSE, json!({ "dps": { "203": 4 } }), &mut payload);
        let corrupt_at = payload.len() + 20;
        frame(RPC_RESPONSE, json!({ "dps": { "204": 1 } }), &mut payload);
        frame(RPC_RESPONSE, json!({ "dps": { "205": 2 } }), &mut payload);
        payload[corrupt_at] ^= 0xff;
        worker.handle_publish(&payload);
        assert_eq!(recorded(&worker.tracker), BTreeMap::from([(203, json!(4))]));
    }

    #[tokio::test(start_paused = true)]
    async fn request_collects_the_answer() {
        let (client, mut worker, _eventloop) = offline(Duration::from_secs(4));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut payload = BytesMut::new();
            frame(RPC_RESPONSE, json!({ "dps": { "204": 2, "220": 0 } }), &mut payload);
            worker.handle_publish(&payload);
        });
        let started = Instant::now();
        let snapshot = client.update_values(&[ZeoField::Mode, ZeoField::Error]).await.unwrap();
        assert_eq!(snapshot.get(ZeoField::Mode), Some(&FieldValue::Integer(2)));
        assert_eq!(snapshot.get(ZeoField::Error), Some(&FieldValue::Integer(0)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_is_no_response() {
        let (client, _worker, _eventloop) = offline(Duration::from_secs(4));
        let started = Instant::now();
        let result = client.update_values(&[ZeoField::Mode, ZeoField::Error]).await;
        assert!(matches!(result, Err(Error::NoResponse(2))), "{result:?}");
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn request_waits_for_the_subscription() {
        let (client, mut worker, _eventloop) = offline(Duration::from_secs(4));
        worker.subscribed.send_replace(false);
        let client = Arc::new(client);
        let pending = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.update_values(&[ZeoField::Mode]).await }
        });
        // Well past the response window: the query has not gone out yet, so nothing timed out.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!pending.is_finished());

        worker.subscribed.send_replace(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut payload = BytesMut::new();
        frame(RPC_RESPONSE, json!({ "dps": { "204": 3 } }), &mut payload);
        worker.handle_publish(&payload);
        let snapshot = pending.await.unwrap().unwrap();
        assert_eq!(snapshot.get(ZeoField::Mode), Some(&FieldValue::Integer(3)));
    }

    #[tokio::test]
    async fn request_fails_once_the_worker_is_gone() {
        let (client, worker, _eventloop) = offline(Duration::from_secs(4));
        worker.subscribed.send_replace(false);
        drop(worker);
        let result = client.update_values(&[ZeoField::Mode]).await;
        assert!(matches!(result, Err(Error::Closed)), "{result:?}");
    }

    #[test]
    fn keep_alive_must_be_a_second_or_more() {
        use clap::Parser as _;
        let parse = |value: &str| Args::try_parse_from(["zeo", "--broker-keep-alive", value]);
        assert!(parse("500ms").is_err());
        assert!(parse("0s").is_err());
        let args = parse("1s").unwrap();
        assert_eq!(*args.broker_keep_alive, Duration::from_secs(1));
        let args = Args::try_parse_from(["zeo"]).unwrap();
        assert_eq!(*args.broker_keep_alive, Duration::from_secs(60));
    }

    #[test]
    fn broker_credentials_are_md5_slices() {
        let (user, password) = broker_credentials("u", "s", "k");
        assert_eq!(user, md5hex("u:k")[2..10]);
        assert_eq!(user.len(), 8);
        assert_eq!(password, md5hex("s:k")[16..]);
        assert_eq!(password.len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_returns_as_soon_as_all_fields_arrive() {
        let tracker = Arc::new(DataPointTracker::default());
        let recorder = Arc::clone(&tracker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            recorder.record([(203, json!(4))]);
            tokio::time::sleep(Duration::from_millis(100)).await;
            recorder.record([(204, json!(1))]);
        });
        let started = Instant::now();
        let points = tracker.wait_for(&[203, 204], started + Duration::from_secs(4)).await;
        assert_eq!(points.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_gives_up_at_the_deadline() {
        let tracker = DataPointTracker::default();
        tracker.record([(203, json!(4)), (999, json!(0))]);
        let deadline = Instant::now() + Duration::from_secs(4);
        let points = tracker.wait_for(&[203, 220], deadline).await;
        assert_eq!(points.into_iter().collect::<Vec<_>>(), vec![(203, json!(4))]);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn forget_drops_stale_values() {
        let tracker = DataPointTracker::default();
        tracker.record([(203, json!(4)), (204, json!(1))]);
        tracker.forget(&[203]);
        let guard = tracker.values.lock().unwrap();
        assert!(!guard.contains_key(&203));
        assert!(guard.contains_key(&204));
    }
}
