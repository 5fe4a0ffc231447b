//! GATT session: connect, resolve the printer characteristic, cache it, tear down
//!
//! One [`Session`] owns the single cached device and everything derived from
//! it. All branching runs off the explicit [`ConnectionState`]; the resolved
//! characteristic only exists inside the `Ready` phase.
//!
//! Every connection attempt runs as its own task tagged with the session
//! generation. Teardown and device replacement bump the generation, which is
//! how an attempt learns it must not publish its result. A superseded attempt
//! may still be inside `connect()`, so the next attempt on the same device
//! waits for it to finish first.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::LinkError;
use crate::log::{LogKind, LogSink};
use crate::platform::{Characteristic, CharacteristicProperties, DeviceHandle, DeviceId};
use crate::supervisor::Listener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No device cached
    Idle,
    /// Device chooser is open
    Selecting,
    Connecting,
    ResolvingService,
    ResolvingCharacteristic,
    /// Characteristic resolved and cached
    Ready,
    /// Device still cached but the link is down; a reconnect may be running
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Selecting => "selecting",
            Self::Connecting => "connecting",
            Self::ResolvingService => "resolving service",
            Self::ResolvingCharacteristic => "resolving characteristic",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// The resolved characteristic together with the session that produced it
///
/// A new handle is minted by every successful resolution, so a handle from
/// before a reconnect never compares equal to one from after it.
#[derive(Clone)]
pub struct CharacteristicHandle {
    characteristic: Arc<dyn Characteristic>,
    session: u64,
}

impl CharacteristicHandle {
    pub fn uuid(&self) -> Uuid {
        self.characteristic.uuid()
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.characteristic.properties()
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub fn same_as(&self, other: &Self) -> bool {
        self.session == other.session && Arc::ptr_eq(&self.characteristic, &other.characteristic)
    }

    pub async fn write(&self, value: &[u8]) -> Result<(), LinkError> {
        self.characteristic
            .write_value(value)
            .await
            .map_err(|e| match e {
                LinkError::WriteFailed(_) => e,
                other => LinkError::WriteFailed(other.to_string()),
            })
    }

    pub(crate) fn characteristic(&self) -> &Arc<dyn Characteristic> {
        &self.characteristic
    }
}

impl PartialEq for CharacteristicHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Debug for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicHandle")
            .field("uuid", &self.uuid())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Runs after the supervisor brings a dropped link back
#[async_trait]
pub trait ReadyHook: Send + Sync {
    async fn on_ready(&self, handle: &CharacteristicHandle) -> Result<(), LinkError>;
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service: printlink_proto::printer::SERVICE,
            characteristic: printlink_proto::printer::CHARACTERISTIC,
            connect_timeout: Duration::from_secs(10),
            auto_reconnect: true,
        }
    }
}

enum Phase {
    Idle,
    Selecting,
    Connecting,
    ResolvingService,
    ResolvingCharacteristic,
    Ready(CharacteristicHandle),
    Disconnected,
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Idle => ConnectionState::Idle,
            Self::Selecting => ConnectionState::Selecting,
            Self::Connecting => ConnectionState::Connecting,
            Self::ResolvingService => ConnectionState::ResolvingService,
            Self::ResolvingCharacteristic => ConnectionState::ResolvingCharacteristic,
            Self::Ready(_) => ConnectionState::Ready,
            Self::Disconnected => ConnectionState::Disconnected,
        }
    }
}

type Attempt = Shared<BoxFuture<'static, Result<CharacteristicHandle, LinkError>>>;

struct Pending {
    generation: u64,
    attempt: Attempt,
}

struct Slot {
    phase: Phase,
    device: Option<DeviceHandle>,
    generation: u64,
    sessions: u64,
    pending: Option<Pending>,
    listener: Option<Listener>,
    /// Most recent attempt, kept after it is superseded
    last: Option<(DeviceId, Attempt)>,
    teardown: bool,
}

impl Slot {
    fn caches(&self, device: &DeviceHandle) -> bool {
        self.device.as_ref().is_some_and(|d| d.id() == device.id())
    }

    fn listens_to(&self, device: &DeviceHandle) -> bool {
        self.listener.as_ref().is_some_and(|l| l.device == device.id())
    }
}

pub(crate) struct Inner {
    config: SessionConfig,
    log: Arc<dyn LogSink>,
    ready_hook: Option<Arc<dyn ReadyHook>>,
    slot: Mutex<Slot>,
    state: watch::Sender<ConnectionState>,
}

/// The single GATT session of a link
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig, log: Arc<dyn LogSink>) -> Self {
        Self::build(config, log, None)
    }

    pub fn with_ready_hook(
        config: SessionConfig,
        log: Arc<dyn LogSink>,
        hook: Arc<dyn ReadyHook>,
    ) -> Self {
        Self::build(config, log, Some(hook))
    }

    fn build(
        config: SessionConfig,
        log: Arc<dyn LogSink>,
        ready_hook: Option<Arc<dyn ReadyHook>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let slot = Slot {
            phase: Phase::Idle,
            device: None,
            generation: 0,
            sessions: 0,
            pending: None,
            listener: None,
            last: None,
            teardown: false,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                log,
                ready_hook,
                slot: Mutex::new(slot),
                state,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().phase.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn cached_device(&self) -> Option<DeviceHandle> {
        self.inner.slot.lock().device.clone()
    }

    /// The cached characteristic; `Some` exactly when the state is `Ready`
    pub fn characteristic(&self) -> Option<CharacteristicHandle> {
        match &self.inner.slot.lock().phase {
            Phase::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Return the cached characteristic, connecting and resolving it first if needed
    ///
    /// Concurrent calls for the same device share one attempt. Passing a
    /// different device than the cached one drops the cached one.
    pub async fn ensure_ready(
        &self,
        device: DeviceHandle,
    ) -> Result<CharacteristicHandle, LinkError> {
        if let Some(handle) = self.ready_handle(&device).await {
            debug!(session = handle.session_id(), "characteristic already cached");
            return Ok(handle);
        }
        self.attempt(device, None)?.await
    }

    /// Like [`Session::ensure_ready`] for a device picked while the state was
    /// `Selecting`; aborts if the session was torn down during selection
    pub(crate) async fn ensure_selected(
        &self,
        device: DeviceHandle,
        selection: u64,
    ) -> Result<CharacteristicHandle, LinkError> {
        self.attempt(device, Some(selection))?.await
    }

    /// Tear the session down: stop listening, clear caches, drop the GATT link
    pub async fn close(&self) {
        let device = {
            let mut slot = self.inner.slot.lock();
            slot.generation += 1;
            slot.pending = None;
            slot.listener = None;
            let device = slot.device.take();
            slot.teardown = device.is_some();
            self.inner.transition(&mut slot, Phase::Idle);
            device
        };
        let Some(device) = device else { return };

        let name = device.name();
        self.inner.log(
            LogKind::Info,
            &format!("Disconnecting from \"{name}\" bluetooth device..."),
        );
        if device.is_connected().await {
            match device.disconnect().await {
                Ok(()) => self
                    .inner
                    .log(LogKind::Info, &format!("\"{name}\" bluetooth device disconnected")),
                Err(e) => self.inner.log(
                    LogKind::Error,
                    &format!("Failed to disconnect \"{name}\": {e}"),
                ),
            }
        } else {
            self.inner.log(
                LogKind::Info,
                &format!("\"{name}\" bluetooth device is already disconnected"),
            );
        }

        self.inner.slot.lock().teardown = false;
    }

    pub(crate) fn begin_selection(&self) -> u64 {
        let mut slot = self.inner.slot.lock();
        if slot.device.is_none() {
            self.inner.transition(&mut slot, Phase::Selecting);
        }
        slot.generation
    }

    pub(crate) fn end_selection(&self, selection: u64) {
        let mut slot = self.inner.slot.lock();
        if slot.generation == selection && matches!(slot.phase, Phase::Selecting) {
            self.inner.transition(&mut slot, Phase::Idle);
        }
    }

    /// Record an unsolicited link drop. Returns false when there is no live
    /// session of `device` for the event to end.
    ///
    /// A drop during an in-flight attempt leaves that attempt running; the
    /// caller reconnects by joining it.
    pub(crate) fn mark_disconnected(&self, device: &DeviceHandle) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.teardown || !slot.caches(device) || matches!(slot.phase, Phase::Disconnected) {
            return false;
        }
        if slot.pending.as_ref().is_some_and(|p| p.generation == slot.generation) {
            debug!("link dropped while an attempt is in flight");
            return true;
        }
        self.inner.transition(&mut slot, Phase::Disconnected);
        true
    }

    pub(crate) fn auto_reconnect(&self) -> bool {
        self.inner.config.auto_reconnect
    }

    pub(crate) fn log(&self, kind: LogKind, message: &str) {
        self.inner.log(kind, message);
    }

    pub(crate) async fn run_ready_hook(&self, handle: &CharacteristicHandle) {
        let Some(hook) = &self.inner.ready_hook else { return };
        if let Err(e) = hook.on_ready(handle).await {
            self.inner.log(LogKind::Error, &e.to_string());
        }
    }

    async fn ready_handle(&self, device: &DeviceHandle) -> Option<CharacteristicHandle> {
        let handle = {
            let slot = self.inner.slot.lock();
            match &slot.phase {
                Phase::Ready(handle) if slot.caches(device) => handle.clone(),
                _ => return None,
            }
        };

        if !device.is_connected().await {
            debug!("cached characteristic belongs to a dropped link");
            return None;
        }

        match &self.inner.slot.lock().phase {
            Phase::Ready(current) if current.same_as(&handle) => Some(handle),
            _ => None,
        }
    }

    fn attempt(
        &self,
        device: DeviceHandle,
        selection: Option<u64>,
    ) -> Result<Attempt, LinkError> {
        let mut slot = self.inner.slot.lock();
        if selection.is_some_and(|generation| generation != slot.generation) {
            return Err(LinkError::Aborted);
        }

        if slot.caches(&device) {
            if let Some(pending) = &slot.pending {
                if pending.generation == slot.generation {
                    debug!("joining in-flight connection attempt");
                    return Ok(pending.attempt.clone());
                }
            }
        } else if let Some(old) = slot.device.take() {
            debug!(old = %old.id(), new = %device.id(), "replacing cached device");
            slot.generation += 1;
            slot.pending = None;
            slot.listener = None;
            tokio::spawn(async move {
                if let Err(e) = old.disconnect().await {
                    debug!(error = %e, "failed to disconnect replaced device");
                }
            });
        }

        let id = device.id();
        let prior = slot
            .last
            .take()
            .filter(|(last, _)| *last == id)
            .map(|(_, attempt)| attempt);
        slot.device = Some(device.clone());
        let generation = slot.generation;
        let needs_listener = !slot.listens_to(&device);
        self.inner.transition(&mut slot, Phase::Connecting);

        let task = tokio::spawn(run_sequence(
            self.inner.clone(),
            device,
            generation,
            needs_listener,
            prior,
        ));
        let attempt = async move { task.await.unwrap_or(Err(LinkError::Aborted)) }
            .boxed()
            .shared();
        slot.pending = Some(Pending {
            generation,
            attempt: attempt.clone(),
        });
        slot.last = Some((id, attempt.clone()));
        Ok(attempt)
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(device = %device.name(), generation = generation))]
async fn run_sequence(
    inner: Arc<Inner>,
    device: DeviceHandle,
    generation: u64,
    needs_listener: bool,
    prior: Option<Attempt>,
) -> Result<CharacteristicHandle, LinkError> {
    // Never two connects in flight against one device
    if let Some(prior) = prior {
        debug!("waiting for superseded attempt to finish");
        let _ = prior.await;
        if !inner.is_current(generation) {
            return Err(LinkError::Aborted);
        }
    }

    // Subscribe before connecting so a drop right after Ready is not missed
    let events = if needs_listener {
        match device.disconnections().await {
            Ok(events) => Some(events),
            Err(e) => {
                debug!(error = %e, "device offers no disconnect events");
                None
            }
        }
    } else {
        None
    };

    let mut resolved = inner.resolve(&device, generation).await;
    if resolved.is_ok() && !device.is_connected().await {
        resolved = Err(LinkError::GattConnectFailed("link dropped during resolution".into()));
    }
    match inner.commit(&device, generation, resolved, events) {
        Some(Ok(handle)) => return Ok(handle),
        Some(Err(e)) => {
            // Disconnected must not leave the link up
            if device.is_connected().await {
                debug!(error = %e, "dropping link of failed attempt");
                if let Err(e) = device.disconnect().await {
                    debug!(error = %e, "failed to drop link of failed attempt");
                }
            }
            return Err(e);
        }
        None => {}
    }

    debug!("connection attempt superseded");
    let cached = inner.slot.lock().caches(&device);
    if !cached && device.is_connected().await {
        if let Err(e) = device.disconnect().await {
            debug!(error = %e, "failed to drop link of abandoned attempt");
        }
    }
    Err(LinkError::Aborted)
}

impl Inner {
    fn log(&self, kind: LogKind, message: &str) {
        self.log.log(kind, message);
    }

    fn transition(&self, slot: &mut Slot, phase: Phase) {
        let next = phase.state();
        debug!(from = %slot.phase.state(), to = %next, "session state");
        slot.phase = phase;
        self.state.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.slot.lock().generation == generation
    }

    /// Move to `phase` unless the attempt tagged `generation` was superseded
    fn advance(&self, generation: u64, phase: Phase) -> Result<(), LinkError> {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return Err(LinkError::Aborted);
        }
        self.transition(&mut slot, phase);
        Ok(())
    }

    async fn resolve(
        &self,
        device: &DeviceHandle,
        generation: u64,
    ) -> Result<Arc<dyn Characteristic>, LinkError> {
        self.log(LogKind::Info, "Connecting to GATT server...");
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, device.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(LinkError::Platform(e))) => return Err(LinkError::GattConnectFailed(e)),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(LinkError::GattConnectFailed(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        }

        self.advance(generation, Phase::ResolvingService)?;
        self.log(LogKind::Info, "GATT server connected, getting service...");
        let service = device.primary_service(self.config.service).await?;

        self.advance(generation, Phase::ResolvingCharacteristic)?;
        self.log(LogKind::Info, "Service found, getting characteristic...");
        service.characteristic(self.config.characteristic).await
    }

    /// Publish the outcome of an attempt. `None` if the attempt was superseded.
    fn commit(
        self: &Arc<Self>,
        device: &DeviceHandle,
        generation: u64,
        resolved: Result<Arc<dyn Characteristic>, LinkError>,
        events: Option<BoxStream<'static, ()>>,
    ) -> Option<Result<CharacteristicHandle, LinkError>> {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return None;
        }
        slot.pending = None;

        let characteristic = match resolved {
            Ok(characteristic) => characteristic,
            Err(e) => {
                self.transition(&mut slot, Phase::Disconnected);
                return Some(Err(e));
            }
        };

        slot.sessions += 1;
        let handle = CharacteristicHandle {
            characteristic,
            session: slot.sessions,
        };
        if let Some(events) = events {
            if !slot.listens_to(device) {
                slot.listener = Some(Listener::spawn(
                    Arc::downgrade(self),
                    device.clone(),
                    events,
                ));
            }
        }
        self.transition(&mut slot, Phase::Ready(handle.clone()));
        drop(slot);

        self.log(LogKind::Info, "Characteristic found");
        Some(Ok(handle))
    }
}
