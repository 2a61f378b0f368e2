//! Fixed identifiers shared by host and joiner builds.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Advertised by hosts and used as the GATT service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000abcd_0000_1000_8000_00805f9b34fb);

/// Request/response characteristic: JOIN is written here, the board is read back.
pub const BOARD_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000abce_0000_1000_8000_00805f9b34fb);

/// Request token a joiner writes before reading the board.
pub const JOIN_TOKEN: &[u8] = b"JOIN";

pub const GATT_SUCCESS: u16 = 0;
pub const GATT_READ_NOT_PERMITTED: u16 = 0x02;
pub const GATT_WRITE_NOT_PERMITTED: u16 = 0x03;
pub const GATT_REQUEST_NOT_SUPPORTED: u16 = 0x06;
/// The intermittent low-level connect failure most stacks eventually hit.
pub const GATT_ERROR: u16 = 0x85;
pub const GATT_FAILURE: u16 = 0x101;

pub fn status_name(code: u16) -> &'static str {
    match code {
        GATT_SUCCESS => "success",
        GATT_READ_NOT_PERMITTED => "read not permitted",
        GATT_WRITE_NOT_PERMITTED => "write not permitted",
        GATT_REQUEST_NOT_SUPPORTED => "request not supported",
        GATT_ERROR => "gatt error",
        GATT_FAILURE => "failure",
        _ => "unknown",
    }
}

/// A GATT service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    /// The layout a host registers.
    pub fn board_service() -> Self {
        Self {
            uuid: SERVICE_UUID,
            characteristics: vec![BOARD_CHARACTERISTIC_UUID],
        }
    }

    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_render_in_bluetooth_base_form() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0000abcd-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BOARD_CHARACTERISTIC_UUID.to_string(),
            "0000abce-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn board_service_layout() {
        let service = GattService::board_service();
        assert_eq!(service.uuid, SERVICE_UUID);
        assert!(service.has_characteristic(BOARD_CHARACTERISTIC_UUID));
        assert!(!service.has_characteristic(SERVICE_UUID));
    }

    #[test]
    fn busy_status_has_name() {
        assert_eq!(GATT_ERROR, 133);
        assert_eq!(status_name(GATT_ERROR), "gatt error");
        assert_eq!(status_name(0x42), "unknown");
    }
}
