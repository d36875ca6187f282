use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Buid;

/// One persisted proximity window for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub id: Option<i64>,
    pub buid: Buid,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub avg_rssi: i32,
    pub med_rssi: i32,
    pub rssi_count: u32,
}

/// Cumulative close-range time with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exposure {
    pub buid: Buid,
    pub exposure_ms: i64,
}
