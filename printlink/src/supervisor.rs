//! Reconnection supervisor
//!
//! One listener task per cached device consumes the device's disconnect
//! events. An unsolicited drop re-drives the session exactly once; a failed
//! attempt is logged and left for the next explicit connect. A drop that
//! lands while an attempt is already running joins that attempt instead of
//! starting a second connect.

use std::sync::{Arc, Weak};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::LinkError;
use crate::log::LogKind;
use crate::platform::{DeviceHandle, DeviceId};
use crate::session::{Inner, Session};

/// Disconnect listener registered on a device. Dropping it unregisters it.
pub(crate) struct Listener {
    pub(crate) device: DeviceId,
    task: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn spawn(
        session: Weak<Inner>,
        device: DeviceHandle,
        events: BoxStream<'static, ()>,
    ) -> Self {
        debug!(device = %device.id(), "registering disconnect listener");
        Self {
            device: device.id(),
            task: tokio::spawn(supervise(session, device, events)),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn supervise(session: Weak<Inner>, device: DeviceHandle, mut events: BoxStream<'static, ()>) {
    while events.next().await.is_some() {
        let Some(inner) = session.upgrade() else { return };
        on_disconnected(&Session::from_inner(inner), &device).await;
    }
    debug!(device = %device.id(), "disconnect events ended");
}

async fn on_disconnected(session: &Session, device: &DeviceHandle) {
    if device.is_connected().await {
        debug!(device = %device.id(), "ignoring stale disconnect event");
        return;
    }
    if !session.mark_disconnected(device) {
        debug!(device = %device.id(), "no live session for disconnect event");
        return;
    }

    let name = device.name();
    if !session.auto_reconnect() {
        session.log(LogKind::Info, &format!("\"{name}\" bluetooth device disconnected"));
        return;
    }

    session.log(
        LogKind::Info,
        &format!("\"{name}\" bluetooth device disconnected, trying to reconnect..."),
    );
    match session.ensure_ready(Arc::clone(device)).await {
        Ok(handle) => session.run_ready_hook(&handle).await,
        Err(LinkError::Aborted) => debug!("reconnect abandoned by teardown"),
        Err(e) => session.log(
            LogKind::Error,
            &format!("Reconnecting to \"{name}\" failed: {e}"),
        ),
    }
}
