use std::sync::Arc;

use crate::LinkError;
use crate::log::{LogKind, LogSink};
use crate::platform::{Bluetooth, DeviceHandle, RequestDeviceOptions};

/// Asks the platform chooser for a peripheral. Never connects.
pub struct DeviceSelector {
    bluetooth: Arc<dyn Bluetooth>,
    log: Arc<dyn LogSink>,
}

impl DeviceSelector {
    pub fn new(bluetooth: Arc<dyn Bluetooth>, log: Arc<dyn LogSink>) -> Self {
        Self { bluetooth, log }
    }

    pub async fn select_device(
        &self,
        options: &RequestDeviceOptions,
    ) -> Result<DeviceHandle, LinkError> {
        self.log.log(LogKind::Info, "Requesting bluetooth device...");
        tracing::debug!(?options, "opening device chooser");

        let device = self.bluetooth.request_device(options).await?;
        self.log.log(
            LogKind::Info,
            &format!("\"{}\" bluetooth device selected", device.name()),
        );
        Ok(device)
    }
}
