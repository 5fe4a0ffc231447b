//! Transport facade: `connect`, `disconnect`, `send`
//!
//! Composes the selector, the session and the notification subscriber. Every
//! failure is reported to the log sink and also returned to the caller.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::log::{LogKind, LogSink};
use crate::notify::{Notification, NotificationSubscriber};
use crate::platform::Bluetooth;
use crate::selector::DeviceSelector;
use crate::session::{CharacteristicHandle, ConnectionState, Session};
use crate::LinkError;

pub struct Link {
    selector: DeviceSelector,
    session: Session,
    subscriber: Arc<NotificationSubscriber>,
    config: ResolvedConfig,
    log: Arc<dyn LogSink>,
    // One chooser at a time
    select_lock: tokio::sync::Mutex<()>,
}

impl Link {
    pub fn new(bluetooth: Arc<dyn Bluetooth>, config: ResolvedConfig, log: Arc<dyn LogSink>) -> Self {
        let subscriber = Arc::new(NotificationSubscriber::new(log.clone()));
        let session = if config.notifications {
            Session::with_ready_hook(config.session_config(), log.clone(), subscriber.clone())
        } else {
            Session::new(config.session_config(), log.clone())
        };
        Self {
            selector: DeviceSelector::new(bluetooth, log.clone()),
            session,
            subscriber,
            config,
            log,
            select_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reach `Ready`, selecting a device first if none is cached
    pub async fn connect(&self) -> Result<(), LinkError> {
        let result = self.try_connect().await;
        if let Err(e) = &result {
            self.log.log(LogKind::Error, &e.to_string());
        }
        result
    }

    async fn try_connect(&self) -> Result<(), LinkError> {
        let handle = match self.session.cached_device() {
            Some(device) => self.session.ensure_ready(device).await?,
            None => self.select_and_connect().await?,
        };
        if self.config.notifications {
            self.subscriber.subscribe(&handle).await?;
        }
        Ok(())
    }

    async fn select_and_connect(&self) -> Result<CharacteristicHandle, LinkError> {
        let _guard = self.select_lock.lock().await;
        if let Some(device) = self.session.cached_device() {
            return self.session.ensure_ready(device).await;
        }

        let selection = self.session.begin_selection();
        match self.selector.select_device(&self.config.request_options()).await {
            Ok(device) => self.session.ensure_selected(device, selection).await,
            Err(e) => {
                self.session.end_selection(selection);
                Err(e)
            }
        }
    }

    /// Tear everything down. Never fails; a link without a device is left as is.
    pub async fn disconnect(&self) {
        self.subscriber.reset();
        self.session.close().await;
    }

    /// Write `payload` to the cached characteristic
    ///
    /// Payloads longer than the configured write length go out as
    /// consecutive writes. An empty payload writes nothing.
    pub async fn send(&self, payload: &[u8]) -> Result<(), LinkError> {
        let Some(handle) = self.session.characteristic() else {
            self.log.log(LogKind::Error, &LinkError::NotReady.to_string());
            return Err(LinkError::NotReady);
        };

        for chunk in payload.chunks(self.config.max_write_len) {
            debug!(len = chunk.len(), session = handle.session_id(), "write");
            if let Err(e) = handle.write(chunk).await {
                self.log.log(LogKind::Error, &e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.subscribe_state()
    }

    pub fn device_name(&self) -> Option<String> {
        self.session.cached_device().map(|d| d.name())
    }

    /// Values pushed by the printer while notifications are armed
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.subscriber.receiver()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }
}
