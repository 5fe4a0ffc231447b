//! Notification subscriber
//!
//! Arms value-change notifications on the resolved characteristic and fans
//! the received values out over a broadcast channel. Arming is tracked per
//! session, so a second subscribe on the same session never reaches the
//! platform twice, and a reconnect (new session) re-arms.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::LinkError;
use crate::log::{LogKind, LogSink};
use crate::session::{CharacteristicHandle, ReadyHook};

const CHANNEL_CAPACITY: usize = 64;

/// A value pushed by the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

struct Armed {
    session: u64,
    pump: Option<JoinHandle<()>>,
}

impl Drop for Armed {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

pub struct NotificationSubscriber {
    log: Arc<dyn LogSink>,
    armed: Mutex<Option<Armed>>,
    tx: broadcast::Sender<Notification>,
}

impl NotificationSubscriber {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            log,
            armed: Mutex::new(None),
            tx,
        }
    }

    /// Arm notifications on `handle`. A no-op if its session is already armed.
    pub async fn subscribe(&self, handle: &CharacteristicHandle) -> Result<(), LinkError> {
        if !handle.properties().can_notify() {
            return Err(LinkError::NotificationUnsupported(handle.uuid()));
        }

        let session = handle.session_id();
        {
            let mut armed = self.armed.lock();
            if armed.as_ref().is_some_and(|a| a.session == session) {
                debug!(session, "notifications already armed");
                return Ok(());
            }
            // Claimed before the first await so a concurrent call sees it
            *armed = Some(Armed {
                session,
                pump: None,
            });
        }

        self.log.log(LogKind::Info, "Starting notifications...");
        let values = match start(handle).await {
            Ok(values) => values,
            Err(e) => {
                let mut armed = self.armed.lock();
                if armed.as_ref().is_some_and(|a| a.session == session) {
                    *armed = None;
                }
                return Err(e);
            }
        };

        {
            let mut armed = self.armed.lock();
            match armed.as_mut() {
                Some(a) if a.session == session => {
                    a.pump = Some(tokio::spawn(pump(values, handle.uuid(), self.tx.clone())));
                }
                _ => {
                    debug!(session, "notifications reset while starting");
                    return Ok(());
                }
            }
        }
        self.log.log(LogKind::Info, "Notifications started");
        Ok(())
    }

    /// Forget the armed session and stop forwarding values
    pub fn reset(&self) {
        *self.armed.lock() = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    pub fn receiver(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

async fn start(handle: &CharacteristicHandle) -> Result<BoxStream<'static, Vec<u8>>, LinkError> {
    let characteristic = handle.characteristic();
    let values = characteristic.notifications().await?;
    characteristic.start_notifications().await?;
    Ok(values)
}

async fn pump(
    mut values: BoxStream<'static, Vec<u8>>,
    characteristic: Uuid,
    tx: broadcast::Sender<Notification>,
) {
    while let Some(value) = values.next().await {
        debug!(len = value.len(), "notification");
        // No receivers is fine; values are dropped until someone listens
        let _ = tx.send(Notification {
            characteristic,
            value,
        });
    }
}

#[async_trait]
impl ReadyHook for NotificationSubscriber {
    async fn on_ready(&self, handle: &CharacteristicHandle) -> Result<(), LinkError> {
        self.subscribe(handle).await
    }
}
