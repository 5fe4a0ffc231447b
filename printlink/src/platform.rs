//! Platform seam: device chooser and GATT access
//!
//! The lifecycle only talks to these traits. [`crate::btle`] implements them
//! on btleplug; tests plug in an in-memory peripheral.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::LinkError;

pub type DeviceHandle = Arc<dyn Device>;

/// Stable identifier of a peripheral (bluez path, CoreBluetooth UUID, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Parameters handed to the platform device chooser
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDeviceOptions {
    /// Offer every nearby device, not only those advertising a service
    pub accept_all_devices: bool,
    /// Services the caller wants to reach once connected
    pub optional_services: Vec<Uuid>,
    /// Pick the first device whose name or address contains this
    pub name_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

#[async_trait]
pub trait Bluetooth: Send + Sync {
    /// Show the chooser and return the peripheral the user picked
    ///
    /// Fails with [`LinkError::SelectionCancelled`] when nothing was picked and
    /// [`LinkError::SelectionUnsupported`] when there is no usable adapter.
    async fn request_device(
        &self,
        options: &RequestDeviceOptions,
    ) -> Result<DeviceHandle, LinkError>;
}

#[async_trait]
pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;

    fn name(&self) -> String;

    async fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    async fn primary_service(&self, uuid: Uuid) -> Result<Box<dyn Service>, LinkError>;

    /// One item per dropped link, including drops caused by [`Device::disconnect`]
    async fn disconnections(&self) -> Result<BoxStream<'static, ()>, LinkError>;
}

#[async_trait]
pub trait Service: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn Characteristic>, LinkError>;
}

#[async_trait]
pub trait Characteristic: Send + Sync {
    fn uuid(&self) -> Uuid;

    fn properties(&self) -> CharacteristicProperties;

    async fn write_value(&self, value: &[u8]) -> Result<(), LinkError>;

    async fn start_notifications(&self) -> Result<(), LinkError>;

    /// Values pushed by the peripheral after [`Characteristic::start_notifications`]
    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, LinkError>;
}
