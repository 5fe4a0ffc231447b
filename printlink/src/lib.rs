//! printlink - BLE connection lifecycle for receipt printers
//!
//! Selects a peripheral, connects to its GATT server, resolves the printer
//! characteristic and keeps it ready across unexpected disconnects.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use printlink::{BtleBluetooth, Link, LinkConfig, TracingLog};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LinkConfig::load_default()?.resolve()?;
//!     let bluetooth = BtleBluetooth::new(config.scan_duration).await?;
//!     let link = Link::new(Arc::new(bluetooth), config, Arc::new(TracingLog));
//!
//!     link.connect().await?;
//!     link.send(&[0x1b, 0x40]).await?;
//!     link.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod config;
mod error;
pub mod log;
mod link;
mod notify;
pub mod platform;
mod selector;
mod session;
mod supervisor;

pub use btle::{BtleBluetooth, Candidate, Picker};
pub use config::{LinkConfig, ResolvedConfig};
pub use error::{ConfigError, LinkError};
pub use link::Link;
pub use log::{LogKind, LogSink, MemoryLog, TracingLog};
pub use notify::{Notification, NotificationSubscriber};
pub use platform::{Bluetooth, Characteristic, Device, DeviceHandle, RequestDeviceOptions, Service};
pub use selector::DeviceSelector;
pub use session::{CharacteristicHandle, ConnectionState, ReadyHook, Session, SessionConfig};

pub use printlink_proto::{parse_uuid, printer, uuid_from_alias};
