//! btleplug backend
//!
//! There is no system device chooser on a desktop central, so selection scans
//! for a while and hands the candidates to a [`Picker`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic as GattCharacteristic, Manager as _,
    Peripheral as _, ScanFilter, Service as GattService, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::{StreamExt, future};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::LinkError;
use crate::platform::{
    Bluetooth, Characteristic, CharacteristicProperties, Device, DeviceHandle, DeviceId,
    RequestDeviceOptions, Service,
};

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises one of the requested services
    pub advertises_service: bool,
}

/// Chooses one of the scanned candidates; `None` cancels the selection
pub type Picker = Box<dyn Fn(&[Candidate]) -> Option<usize> + Send + Sync>;

/// An adapter that cannot scan leaves the host without usable BLE
fn scan_failed(e: btleplug::Error) -> LinkError {
    LinkError::SelectionUnsupported(e.to_string())
}

/// Picks the first candidate advertising the requested service
pub fn first_advertising(candidates: &[Candidate]) -> Option<usize> {
    candidates.iter().position(|c| c.advertises_service)
}

pub struct BtleBluetooth {
    adapter: Adapter,
    scan_duration: Duration,
    picker: Picker,
}

impl BtleBluetooth {
    /// Use the first bluetooth adapter of the host
    pub async fn new(scan_duration: Duration) -> Result<Self, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::SelectionUnsupported(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| LinkError::SelectionUnsupported(e.to_string()))?;
        let adapter = adapters.into_iter().next().ok_or_else(|| {
            LinkError::SelectionUnsupported("no bluetooth adapter found".to_string())
        })?;
        Ok(Self {
            adapter,
            scan_duration,
            picker: Box::new(first_advertising),
        })
    }

    pub fn with_picker(mut self, picker: Picker) -> Self {
        self.picker = picker;
        self
    }

    /// Every peripheral seen during one scan window
    pub async fn scan(&self, services: &[Uuid]) -> Result<Vec<Candidate>, LinkError> {
        Ok(self
            .discover(services)
            .await?
            .into_iter()
            .map(|(_, candidate)| candidate)
            .collect())
    }

    #[instrument(level = "debug", skip_all, fields(duration_ms = self.scan_duration.as_millis() as u64))]
    async fn discover(&self, services: &[Uuid]) -> Result<Vec<(Peripheral, Candidate)>, LinkError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(scan_failed)?;
        tokio::time::sleep(self.scan_duration).await;

        let peripherals = self.adapter.peripherals().await.map_err(scan_failed);
        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "failed to stop scan");
        }

        let mut found = Vec::new();
        for peripheral in peripherals? {
            if let Some(props) = peripheral.properties().await? {
                let candidate = Candidate {
                    name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                    address: peripheral.address().to_string(),
                    rssi: props.rssi,
                    advertises_service: props.services.iter().any(|s| services.contains(s)),
                };
                found.push((peripheral, candidate));
            }
        }
        debug!(count = found.len(), "scan finished");
        Ok(found)
    }
}

#[async_trait]
impl Bluetooth for BtleBluetooth {
    async fn request_device(
        &self,
        options: &RequestDeviceOptions,
    ) -> Result<DeviceHandle, LinkError> {
        let mut found = self.discover(&options.optional_services).await?;

        if let Some(filter) = &options.name_filter {
            found.retain(|(_, c)| c.name.contains(filter.as_str()) || c.address.contains(filter.as_str()));
        } else if !options.accept_all_devices {
            found.retain(|(_, c)| c.advertises_service);
        }

        let candidates: Vec<Candidate> = found.iter().map(|(_, c)| c.clone()).collect();
        // A name filter is an explicit choice; take the first match
        let picked = if options.name_filter.is_some() && !candidates.is_empty() {
            Some(0)
        } else {
            (self.picker)(&candidates)
        };
        let Some(index) = picked.filter(|i| *i < found.len()) else {
            return Err(LinkError::SelectionCancelled);
        };

        let (peripheral, candidate) = found.swap_remove(index);
        Ok(Arc::new(BtleDevice {
            adapter: self.adapter.clone(),
            peripheral,
            name: candidate.name,
        }))
    }
}

pub struct BtleDevice {
    adapter: Adapter,
    peripheral: Peripheral,
    name: String,
}

#[async_trait]
impl Device for BtleDevice {
    fn id(&self) -> DeviceId {
        DeviceId(self.peripheral.id().to_string())
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn connect(&self) -> Result<(), LinkError> {
        self.peripheral
            .connect()
            .await
            .map_err(|e| LinkError::GattConnectFailed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        Ok(self.peripheral.disconnect().await?)
    }

    async fn primary_service(&self, uuid: Uuid) -> Result<Box<dyn Service>, LinkError> {
        self.peripheral.discover_services().await?;
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == uuid)
            .ok_or(LinkError::ServiceNotFound(uuid))?;
        Ok(Box::new(BtleService {
            peripheral: self.peripheral.clone(),
            service,
        }))
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>, LinkError> {
        let id = self.peripheral.id();
        let events = self.adapter.events().await?;
        Ok(events
            .filter_map(move |event| {
                let dropped = matches!(&event, CentralEvent::DeviceDisconnected(d) if *d == id);
                future::ready(dropped.then_some(()))
            })
            .boxed())
    }
}

struct BtleService {
    peripheral: Peripheral,
    service: GattService,
}

#[async_trait]
impl Service for BtleService {
    fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn Characteristic>, LinkError> {
        let characteristic = self
            .service
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or(LinkError::CharacteristicNotFound(uuid))?;
        Ok(Arc::new(BtleCharacteristic {
            peripheral: self.peripheral.clone(),
            characteristic,
        }))
    }
}

struct BtleCharacteristic {
    peripheral: Peripheral,
    characteristic: GattCharacteristic,
}

#[async_trait]
impl Characteristic for BtleCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    fn properties(&self) -> CharacteristicProperties {
        let flags = self.characteristic.properties;
        CharacteristicProperties {
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
        }
    }

    async fn write_value(&self, value: &[u8]) -> Result<(), LinkError> {
        let write_type = if self.characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&self.characteristic, value, write_type)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn start_notifications(&self) -> Result<(), LinkError> {
        Ok(self.peripheral.subscribe(&self.characteristic).await?)
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, LinkError> {
        let uuid = self.characteristic.uuid;
        let values = self.peripheral.notifications().await?;
        Ok(values
            .filter_map(move |n| future::ready((n.uuid == uuid).then_some(n.value)))
            .boxed())
    }
}
