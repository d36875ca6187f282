use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MacAddress;

/// Which of the two concurrent scans produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanKind {
    /// Hardware-filtered on the service UUID.
    Direct,
    /// Unfiltered by service, catches backgrounded peers.
    Background,
}

/// One scan result as delivered by the radio stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub mac: MacAddress,
    pub rssi: i32,
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub service_uuids: Vec<Uuid>,
    pub observed_at: DateTime<Utc>,
}

/// Everything the radio stack can tell the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RadioEvent {
    ScanResult {
        scan: ScanKind,
        advertisement: Advertisement,
    },
    BatchScanResults {
        scan: ScanKind,
        advertisements: Vec<Advertisement>,
    },
    ScanFailed {
        scan: ScanKind,
        code: i32,
    },
    AdvertiseStarted,
    AdvertiseFailed {
        code: i32,
    },
    Connected {
        mac: MacAddress,
    },
    Disconnected {
        mac: MacAddress,
    },
    ServicesDiscovered {
        mac: MacAddress,
        success: bool,
        has_identity_characteristic: bool,
    },
    IdentityRead {
        mac: MacAddress,
        value: Option<Vec<u8>>,
    },
    ConnectionFailed {
        mac: MacAddress,
        status: i32,
    },
}
