//! Over-the-air constants shared by scanning, resolution and advertising.

use uuid::Uuid;

/// Well-known service every participating peer advertises.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x1440dd68_67e4_11ea_bc55_0242ac130003);

/// Read-only characteristic under [`SERVICE_UUID`] holding the raw 10-byte identity token.
pub const IDENTITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x9472fbde_04ff_4fff_be1c_b9d3287e8f28);

/// Manufacturer id the background scan filters on.
pub const APPLE_MANUFACTURER_ID: u16 = 76;

// AD types
pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_COMPLETE_SERVICE_UUIDS_128: u8 = 0x07;
pub const AD_TYPE_SERVICE_DATA_16: u8 = 0x16;
pub const AD_TYPE_SERVICE_DATA_32: u8 = 0x20;
pub const AD_TYPE_SERVICE_DATA_128: u8 = 0x21;

/// LE General Discoverable, BR/EDR not supported.
pub const FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// Offsets and values of the manufacturer-data pattern left behind by a
/// backgrounded peer that only exposes its service through an overflow area.
pub const HIDDEN_PATTERN_OFFSETS: [usize; 3] = [29, 30, 31];
pub const HIDDEN_PATTERN_VALUES: [u8; 3] = [0x00, 0x02, 0x00];

/// Service UUID in the little-endian byte order used on air.
pub fn service_uuid_le() -> [u8; 16] {
    let mut bytes = *SERVICE_UUID.as_bytes();
    bytes.reverse();
    bytes
}
