//! GATT profile of BLE receipt printers
//!
//! Most ESC/POS BLE printers expose one primary service with a single
//! characteristic that accepts the command stream and notifies status bytes.

use uuid::Uuid;

use crate::uuid_from_alias;

/// Printer service alias
pub const SERVICE_ALIAS: u16 = 0x18F0;

/// Printer data characteristic alias (write / notify)
pub const CHARACTERISTIC_ALIAS: u16 = 0x2AF1;

/// Printer service UUID: 000018f0-0000-1000-8000-00805f9b34fb
pub const SERVICE: Uuid = uuid_from_alias(SERVICE_ALIAS as u32);

/// Printer data characteristic UUID: 00002af1-0000-1000-8000-00805f9b34fb
pub const CHARACTERISTIC: Uuid = uuid_from_alias(CHARACTERISTIC_ALIAS as u32);

/// Largest single write a GATT characteristic value can hold
pub const MAX_ATTRIBUTE_LEN: usize = 512;
