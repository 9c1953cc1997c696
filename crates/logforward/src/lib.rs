//! Ring-buffered event/trace/sensor recording, forwarded in batches to
//! every `history` service this process's discovery client has found.
//!
//! Events, traces and sensor readings are separate buffers so a chatty
//! trace stream never pushes a real event out before it's had a chance
//! to forward. A record that fails to deliver is retried on the next
//! flush rather than dropped; it only leaves the buffer once delivered
//! or evicted by the ring wrapping around.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use discovery::DiscoveryClient;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::interval;

pub const EVENT_DEPTH: usize = 256;
pub const TRACE_DEPTH: usize = 16;
pub const SENSOR_DEPTH: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const SENSOR_FLUSH_FLOOR: i64 = 10;
const HISTORY_SERVICE_NAME: &str = "history";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Fresh,
    Forwarding,
    Delivered,
    Failed,
}

trait Stateful {
    fn state(&self) -> DeliveryState;
    fn set_state(&mut self, s: DeliveryState);
}

#[derive(Debug, Clone)]
pub struct Record {
    pub timestamp: i64,
    pub message: String,
    state: DeliveryState,
}

impl Stateful for Record {
    fn state(&self) -> DeliveryState {
        self.state
    }
    fn set_state(&mut self, s: DeliveryState) {
        self.state = s;
    }
}

/// One sensor reading, matching `houselog_sensor_data`'s field set:
/// a millisecond-precision timestamp, a location, a reading name, and
/// its value (already formatted — `houselog_sensor_numeric` is just a
/// convenience that formats a number before calling this).
#[derive(Debug, Clone)]
pub struct SensorRecord {
    pub timestamp_ms: i64,
    pub location: String,
    pub name: String,
    pub value: String,
    pub unit: String,
    state: DeliveryState,
}

impl Stateful for SensorRecord {
    fn state(&self) -> DeliveryState {
        self.state
    }
    fn set_state(&mut self, s: DeliveryState) {
        self.state = s;
    }
}

struct Ring<T> {
    depth: usize,
    records: VecDeque<T>,
}

impl<T: Clone + Stateful> Ring<T> {
    fn new(depth: usize) -> Self {
        Self { depth, records: VecDeque::with_capacity(depth) }
    }

    fn push(&mut self, record: T) {
        if self.records.len() == self.depth {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Records in `Fresh` or `Failed` state, paired with their index so
    /// the caller can write the outcome back without a second scan.
    fn pending(&self) -> Vec<(usize, T)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r.state(), DeliveryState::Fresh | DeliveryState::Failed))
            .map(|(i, r)| (i, r.clone()))
            .collect()
    }

    fn mark(&mut self, index: usize, state: DeliveryState) {
        if let Some(r) = self.records.get_mut(index) {
            r.set_state(state);
        }
    }
}

/// Local-only variant of a forwarded event: recorded but never sent
/// anywhere, for diagnostics an operator only wants in this process's
/// own ring buffer.
pub enum Kind {
    Event,
    Trace,
    LocalOnly,
}

pub struct Forwarder {
    http: reqwest::Client,
    discovery: Arc<DiscoveryClient>,
    host: String,
    app: String,
    events: Mutex<Ring<Record>>,
    traces: Mutex<Ring<Record>>,
    sensors: Mutex<Ring<SensorRecord>>,
    events_latest: AtomicI64,
    traces_latest: AtomicI64,
    sensors_latest: AtomicI64,
    sensor_last_flush: AtomicI64,
}

impl Forwarder {
    pub fn new(discovery: Arc<DiscoveryClient>, host: impl Into<String>, app: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().expect("reqwest client"),
            discovery,
            host: host.into(),
            app: app.into(),
            events: Mutex::new(Ring::new(EVENT_DEPTH)),
            traces: Mutex::new(Ring::new(TRACE_DEPTH)),
            sensors: Mutex::new(Ring::new(SENSOR_DEPTH)),
            events_latest: AtomicI64::new(0),
            traces_latest: AtomicI64::new(0),
            sensors_latest: AtomicI64::new(0),
            sensor_last_flush: AtomicI64::new(0),
        })
    }

    pub fn record(&self, kind: Kind, message: impl Into<String>) {
        match kind {
            Kind::Event => {
                self.events.lock().push(Record { timestamp: now(), message: message.into(), state: DeliveryState::Fresh });
                self.events_latest.fetch_add(1, Ordering::Relaxed);
            }
            Kind::Trace => {
                self.traces.lock().push(Record { timestamp: now(), message: message.into(), state: DeliveryState::Fresh });
                self.traces_latest.fetch_add(1, Ordering::Relaxed);
            }
            Kind::LocalOnly => log::debug!("{}", message.into()),
        }
    }

    /// Records a sensor reading. Unlike events/traces, sensor data is
    /// not purely time-driven — the caller should call
    /// [`Forwarder::flush_sensors`] once a batch of readings is
    /// complete; the background loop only flushes pending sensor data
    /// on its own after a 10s floor.
    pub fn record_sensor(&self, location: impl Into<String>, name: impl Into<String>, value: impl Into<String>, unit: impl Into<String>) {
        self.sensors.lock().push(SensorRecord {
            timestamp_ms: now_ms(),
            location: location.into(),
            name: name.into(),
            value: value.into(),
            unit: unit.into(),
            state: DeliveryState::Fresh,
        });
        self.sensors_latest.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sensor_numeric(&self, location: impl Into<String>, name: impl Into<String>, value: i64, unit: impl Into<String>) {
        self.record_sensor(location, name, value.to_string(), unit);
    }

    fn envelope(&self, array_key: &str, latest: i64, rows: Vec<Value>) -> Value {
        let mut inner = serde_json::Map::new();
        inner.insert("latest".to_string(), json!(latest));
        inner.insert(array_key.to_string(), json!(rows));

        let mut out = serde_json::Map::new();
        out.insert("host".to_string(), json!(self.host));
        out.insert("apps".to_string(), json!([self.app]));
        out.insert("timestamp".to_string(), json!(now()));
        out.insert(self.app.clone(), Value::Object(inner));
        Value::Object(out)
    }

    /// POSTs `envelope` to `/log/<array_key>` on every discovered,
    /// currently-live `history` instance — the `/log/*` alias route
    /// that's application-independent, matching the registered
    /// `/<app>/log/events`-style endpoints' generic counterpart.
    async fn post_to_history(&self, array_key: &str, envelope: &Value) -> bool {
        let hosts: Vec<String> = self
            .discovery
            .instances_for(HISTORY_SERVICE_NAME)
            .into_iter()
            .filter(|i| i.is_current(now()))
            .map(|i| i.url)
            .collect();

        if hosts.is_empty() {
            return false;
        }

        let mut any_delivered = false;
        for host in &hosts {
            let url = format!("{host}/log/{array_key}");
            match self.http.post(&url).json(envelope).send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => any_delivered = true,
                Err(e) => log::warn!("log forward to {url} failed: {e}"),
            }
        }
        any_delivered
    }

    async fn flush_events(&self) {
        let pending = self.events.lock().pending();
        if pending.is_empty() {
            return;
        }
        for (i, _) in &pending {
            self.events.lock().mark(*i, DeliveryState::Forwarding);
        }

        let rows: Vec<Value> = pending.iter().map(|(_, r)| json!([r.timestamp, r.message])).collect();
        let envelope = self.envelope("events", self.events_latest.load(Ordering::Relaxed), rows);
        let outcome = if self.post_to_history("events", &envelope).await { DeliveryState::Delivered } else { DeliveryState::Failed };

        let mut events = self.events.lock();
        for (i, _) in &pending {
            events.mark(*i, outcome);
        }
    }

    async fn flush_traces(&self) {
        let pending = self.traces.lock().pending();
        if pending.is_empty() {
            return;
        }
        for (i, _) in &pending {
            self.traces.lock().mark(*i, DeliveryState::Forwarding);
        }

        let rows: Vec<Value> = pending.iter().map(|(_, r)| json!([r.timestamp, r.message])).collect();
        let envelope = self.envelope("traces", self.traces_latest.load(Ordering::Relaxed), rows);
        let outcome = if self.post_to_history("traces", &envelope).await { DeliveryState::Delivered } else { DeliveryState::Failed };

        let mut traces = self.traces.lock();
        for (i, _) in &pending {
            traces.mark(*i, outcome);
        }
    }

    /// Forces transmission of any pending sensor data. Applications that
    /// receive readings in batches call this when a batch is complete;
    /// the background loop calls it too, subject to the 10s floor.
    pub async fn flush_sensors(&self) {
        let pending = self.sensors.lock().pending();
        if pending.is_empty() {
            return;
        }
        for (i, _) in &pending {
            self.sensors.lock().mark(*i, DeliveryState::Forwarding);
        }

        let rows: Vec<Value> = pending
            .iter()
            .map(|(_, r)| json!([r.timestamp_ms, r.location, r.name, r.value, r.unit]))
            .collect();
        let envelope = self.envelope("sensor", self.sensors_latest.load(Ordering::Relaxed), rows);
        let outcome = if self.post_to_history("sensor", &envelope).await { DeliveryState::Delivered } else { DeliveryState::Failed };

        let mut sensors = self.sensors.lock();
        for (i, _) in &pending {
            sensors.mark(*i, outcome);
        }
        self.sensor_last_flush.store(now(), Ordering::Relaxed);
    }

    pub fn run(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = interval(FLUSH_INTERVAL);
            loop {
                tick.tick().await;
                self.flush_events().await;
                self.flush_traces().await;

                let has_pending = !self.sensors.lock().pending().is_empty();
                if has_pending && now() >= self.sensor_last_flush.load(Ordering::Relaxed) + SENSOR_FLUSH_FLOOR {
                    self.flush_sensors().await;
                }
            }
        });
    }
}
