//! printlink protocol - GATT identifiers for BLE receipt printers
//!
//! Identifiers arrive either as 16/32-bit aliases (`0x18F0`) or as full
//! 128-bit UUID strings. Both forms of the same identifier resolve to the
//! same [`uuid::Uuid`].

pub mod printer;

use uuid::Uuid;

/// Bluetooth base UUID: 00000000-0000-1000-8000-00805f9b34fb
pub const BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB);

const BASE_LOW_BITS: u128 = 0x0000_1000_8000_00805F9B34FB;
const ALIAS_SHIFT: u32 = 96;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UuidError {
    #[error("empty identifier")]
    Empty,
    #[error("alias {0:?} is longer than 32 bits")]
    AliasTooLong(String),
    #[error("invalid identifier {input:?}: {reason}")]
    Invalid { input: String, reason: String },
}

/// Expand a 16 or 32 bit alias against the Bluetooth base UUID
pub const fn uuid_from_alias(alias: u32) -> Uuid {
    Uuid::from_u128(((alias as u128) << ALIAS_SHIFT) | BASE_LOW_BITS)
}

/// Return the 16-bit alias of a UUID built on the base UUID, if it has one
pub fn short_alias(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & ((1u128 << ALIAS_SHIFT) - 1) != BASE_LOW_BITS {
        return None;
    }
    u16::try_from(value >> ALIAS_SHIFT).ok()
}

/// Parse a service or characteristic identifier
///
/// Accepted forms:
/// - `0x18F0` / `0X18f0` (hex alias, up to 8 digits)
/// - `18f0`, `000018f0` (bare 4 or 8 digit hex alias)
/// - `000018f0-0000-1000-8000-00805f9b34fb` (full UUID, any case)
pub fn parse_uuid(input: &str) -> Result<Uuid, UuidError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(UuidError::Empty);
    }

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return parse_alias(input, hex);
    }

    if (s.len() == 4 || s.len() == 8) && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return parse_alias(input, s);
    }

    Uuid::parse_str(s).map_err(|e| UuidError::Invalid {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

fn parse_alias(input: &str, hex: &str) -> Result<Uuid, UuidError> {
    if hex.is_empty() {
        return Err(UuidError::Invalid {
            input: input.to_string(),
            reason: "missing hex digits".to_string(),
        });
    }
    if hex.len() > 8 {
        return Err(UuidError::AliasTooLong(input.to_string()));
    }
    u32::from_str_radix(hex, 16)
        .map(uuid_from_alias)
        .map_err(|e| UuidError::Invalid {
            input: input.to_string(),
            reason: e.to_string(),
        })
}

/// Human readable form: `0x18f0` for base UUIDs, the full string otherwise
pub fn display_uuid(uuid: Uuid) -> String {
    match short_alias(uuid) {
        Some(alias) => format!("0x{alias:04x}"),
        None => uuid.to_string(),
    }
}
