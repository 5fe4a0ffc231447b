//! In-memory bluetooth platform for the lifecycle tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, watch};
use uuid::Uuid;

use printlink::platform::{
    Bluetooth, Characteristic, CharacteristicProperties, Device, DeviceHandle, DeviceId,
    RequestDeviceOptions, Service,
};
use printlink::{Link, LinkError, MemoryLog, ResolvedConfig, printer};

pub const WAIT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds; panics after [`WAIT`]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached in {WAIT:?}");
}

/// Let spawned tasks run to quiescence
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Counts a call as in flight until dropped
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn pass(gate: &watch::Sender<bool>) {
    let mut rx = gate.subscribe();
    let _ = rx.wait_for(|held| !*held).await;
}

fn stream_of<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

pub struct FakeCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    writes: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    notify_starts: AtomicUsize,
    values: broadcast::Sender<Vec<u8>>,
}

impl FakeCharacteristic {
    fn new(properties: CharacteristicProperties) -> Self {
        Self {
            uuid: printer::CHARACTERISTIC,
            properties,
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            notify_starts: AtomicUsize::new(0),
            values: broadcast::channel(16).0,
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn notify_starts(&self) -> usize {
        self.notify_starts.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Push a value as if the printer notified it
    pub fn notify(&self, value: &[u8]) {
        let _ = self.values.send(value.to_vec());
    }
}

#[async_trait]
impl Characteristic for FakeCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    async fn write_value(&self, value: &[u8]) -> Result<(), LinkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::Platform("write rejected".into()));
        }
        self.writes.lock().push(value.to_vec());
        Ok(())
    }

    async fn start_notifications(&self) -> Result<(), LinkError> {
        bump(&self.notify_starts);
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, LinkError> {
        Ok(stream_of(self.values.subscribe()))
    }
}

struct FakeService {
    uuid: Uuid,
    characteristic: Option<Arc<FakeCharacteristic>>,
    lookups: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for FakeService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn Characteristic>, LinkError> {
        bump(&self.lookups);
        match &self.characteristic {
            Some(c) if c.uuid == uuid => Ok(c.clone()),
            _ => Err(LinkError::CharacteristicNotFound(uuid)),
        }
    }
}

/// A printer that counts every GATT call made against it
pub struct FakeDevice {
    name: String,
    connected: AtomicBool,
    connects: AtomicUsize,
    connects_in_flight: AtomicUsize,
    peak_connects_in_flight: AtomicUsize,
    service_lookups: AtomicUsize,
    characteristic_lookups: Arc<AtomicUsize>,
    disconnects: AtomicUsize,
    event_subscriptions: AtomicUsize,
    connect_failures: Mutex<VecDeque<LinkError>>,
    has_service: AtomicBool,
    has_characteristic: AtomicBool,
    held: watch::Sender<bool>,
    /// Signalled each time a connect starts
    pub connect_started: Notify,
    events: broadcast::Sender<()>,
    characteristic: Arc<FakeCharacteristic>,
}

impl FakeDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_properties(
            name,
            CharacteristicProperties {
                write: true,
                notify: true,
                ..Default::default()
            },
        )
    }

    pub fn with_properties(name: &str, properties: CharacteristicProperties) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            connects_in_flight: AtomicUsize::new(0),
            peak_connects_in_flight: AtomicUsize::new(0),
            service_lookups: AtomicUsize::new(0),
            characteristic_lookups: Arc::new(AtomicUsize::new(0)),
            disconnects: AtomicUsize::new(0),
            event_subscriptions: AtomicUsize::new(0),
            connect_failures: Mutex::new(VecDeque::new()),
            has_service: AtomicBool::new(true),
            has_characteristic: AtomicBool::new(true),
            held: watch::channel(false).0,
            connect_started: Notify::new(),
            events: broadcast::channel(16).0,
            characteristic: Arc::new(FakeCharacteristic::new(properties)),
        })
    }

    pub fn handle(self: &Arc<Self>) -> DeviceHandle {
        self.clone()
    }

    pub fn characteristic(&self) -> &FakeCharacteristic {
        &self.characteristic
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Most connects ever running at once
    pub fn peak_concurrent_connects(&self) -> usize {
        self.peak_connects_in_flight.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn event_subscriptions(&self) -> usize {
        self.event_subscriptions.load(Ordering::SeqCst)
    }

    pub fn characteristic_lookups(&self) -> usize {
        self.characteristic_lookups.load(Ordering::SeqCst)
    }

    /// connect + service + characteristic lookups
    pub fn gatt_calls(&self) -> usize {
        self.connects()
            + self.service_lookups.load(Ordering::SeqCst)
            + self.characteristic_lookups()
    }

    /// Park every connect until [`FakeDevice::release_connects`]
    pub fn hold_connects(&self) {
        self.held.send_replace(true);
    }

    pub fn release_connects(&self) {
        self.held.send_replace(false);
    }

    pub fn fail_next_connect(&self, error: LinkError) {
        self.connect_failures.lock().push_back(error);
    }

    pub fn set_service(&self, present: bool) {
        self.has_service.store(present, Ordering::SeqCst);
    }

    pub fn set_characteristic(&self, present: bool) {
        self.has_characteristic.store(present, Ordering::SeqCst);
    }

    /// The link drops and the platform reports it
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(());
    }

    /// The link drops without any event
    pub fn lose_link_quietly(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// A disconnect event for a link that is actually up
    pub fn fire_stale_event(&self) {
        let _ = self.events.send(());
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn id(&self) -> DeviceId {
        DeviceId(format!("fake:{}", self.name))
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn is_connected(&self) -> bool {
        self.connected()
    }

    async fn connect(&self) -> Result<(), LinkError> {
        bump(&self.connects);
        let _running = InFlight::enter(&self.connects_in_flight, &self.peak_connects_in_flight);
        self.connect_started.notify_one();
        pass(&self.held).await;
        if let Some(e) = self.connect_failures.lock().pop_front() {
            return Err(e);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        bump(&self.disconnects);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(());
        }
        Ok(())
    }

    async fn primary_service(&self, uuid: Uuid) -> Result<Box<dyn Service>, LinkError> {
        self.service_lookups.fetch_add(1, Ordering::SeqCst);
        if !self.connected() {
            return Err(LinkError::Platform("GATT server is disconnected".into()));
        }
        if !self.has_service.load(Ordering::SeqCst) || uuid != printer::SERVICE {
            return Err(LinkError::ServiceNotFound(uuid));
        }
        let characteristic = self
            .has_characteristic
            .load(Ordering::SeqCst)
            .then(|| self.characteristic.clone());
        Ok(Box::new(FakeService {
            uuid,
            characteristic,
            lookups: self.characteristic_lookups.clone(),
        }))
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>, LinkError> {
        bump(&self.event_subscriptions);
        Ok(stream_of(self.events.subscribe()))
    }
}

pub enum Chooser {
    Pick,
    Cancel,
    Unsupported,
}

/// Device chooser offering a single printer
pub struct FakeBluetooth {
    device: Arc<FakeDevice>,
    chooser: Mutex<Chooser>,
    held: watch::Sender<bool>,
    requests: AtomicUsize,
    last_options: Mutex<Option<RequestDeviceOptions>>,
}

impl FakeBluetooth {
    pub fn new(device: Arc<FakeDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            chooser: Mutex::new(Chooser::Pick),
            held: watch::channel(false).0,
            requests: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        })
    }

    pub fn set_chooser(&self, chooser: Chooser) {
        *self.chooser.lock() = chooser;
    }

    /// Keep the chooser open until [`FakeBluetooth::release_selection`]
    pub fn hold_selection(&self) {
        self.held.send_replace(true);
    }

    pub fn release_selection(&self) {
        self.held.send_replace(false);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<RequestDeviceOptions> {
        self.last_options.lock().clone()
    }
}

#[async_trait]
impl Bluetooth for FakeBluetooth {
    async fn request_device(
        &self,
        options: &RequestDeviceOptions,
    ) -> Result<DeviceHandle, LinkError> {
        bump(&self.requests);
        *self.last_options.lock() = Some(options.clone());
        pass(&self.held).await;
        match *self.chooser.lock() {
            Chooser::Pick => Ok(self.device.clone()),
            Chooser::Cancel => Err(LinkError::SelectionCancelled),
            Chooser::Unsupported => Err(LinkError::SelectionUnsupported(
                "no bluetooth adapter found".into(),
            )),
        }
    }
}

/// A link wired to one fake printer
pub struct Harness {
    pub link: Arc<Link>,
    pub bluetooth: Arc<FakeBluetooth>,
    pub device: Arc<FakeDevice>,
    pub log: MemoryLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ResolvedConfig::default())
    }

    pub fn with_config(config: ResolvedConfig) -> Self {
        Self::with_device(FakeDevice::new("Printer-A"), config)
    }

    pub fn with_device(device: Arc<FakeDevice>, config: ResolvedConfig) -> Self {
        let bluetooth = FakeBluetooth::new(device.clone());
        let log = MemoryLog::new();
        let link = Link::new(bluetooth.clone(), config, Arc::new(log.clone()));
        Self {
            link: Arc::new(link),
            bluetooth,
            device,
            log,
        }
    }

    pub fn spawn_connect(&self) -> tokio::task::JoinHandle<Result<(), LinkError>> {
        let link = self.link.clone();
        tokio::spawn(async move { link.connect().await })
    }

    /// Characteristic cached only while the device reports connected
    pub fn assert_consistent(&self) {
        let cached = self.link.session().characteristic();
        assert_eq!(
            cached.is_some(),
            self.link.state() == printlink::ConnectionState::Ready,
            "characteristic cached outside Ready"
        );
        if cached.is_some() {
            assert!(self.device.connected(), "characteristic cached while disconnected");
        }
    }

    pub fn count(&self, message: &str) -> usize {
        self.log.messages().iter().filter(|m| m.as_str() == message).count()
    }
}

