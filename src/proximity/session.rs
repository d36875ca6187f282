use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Buid, MacAddress};

static NEXT_SAMPLE_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiSample {
    pub rssi: i32,
    pub at: DateTime<Utc>,
    /// Process-unique, lets a flush tell persisted samples apart from newer ones.
    pub seq: u64,
}

/// Statistics emitted for a session at flush time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RssiSummary {
    pub avg_rssi: i32,
    pub med_rssi: i32,
    pub rssi_count: u32,
}

impl RssiSummary {
    /// Mean is rounded to the nearest integer (halves away from zero); for an
    /// even count the median is the lower of the two middle samples.
    pub fn from_samples(samples: &[i32]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let sum: i64 = samples.iter().map(|&rssi| i64::from(rssi)).sum();
        let avg = (sum as f64 / samples.len() as f64).round() as i32;

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let med = sorted[(sorted.len() - 1) / 2];

        Some(Self {
            avg_rssi: avg,
            med_rssi: med,
            rssi_count: samples.len() as u32,
        })
    }
}

/// One peer observed during one scanning window.
#[derive(Debug, Clone)]
pub struct ScanSession {
    buid: Option<Buid>,
    mac: MacAddress,
    timestamp_start: DateTime<Utc>,
    timestamp_end: DateTime<Utc>,
    samples: Vec<RssiSample>,
}

impl ScanSession {
    pub fn new(buid: Option<Buid>, mac: MacAddress, at: DateTime<Utc>) -> Self {
        Self {
            buid,
            mac,
            timestamp_start: at,
            timestamp_end: at,
            samples: Vec::new(),
        }
    }

    pub fn buid(&self) -> Option<Buid> {
        self.buid
    }

    pub fn mac(&self) -> &MacAddress {
        &self.mac
    }

    pub fn timestamp_start(&self) -> DateTime<Utc> {
        self.timestamp_start
    }

    pub fn timestamp_end(&self) -> DateTime<Utc> {
        self.timestamp_end
    }

    pub fn samples(&self) -> &[RssiSample] {
        &self.samples
    }

    pub fn rssi_count(&self) -> usize {
        self.samples.len()
    }

    pub fn last_rssi(&self) -> Option<i32> {
        self.samples.last().map(|sample| sample.rssi)
    }

    /// Binds the identity. A session that already has one keeps it.
    pub fn bind(&mut self, buid: Buid) -> bool {
        if self.buid.is_some() {
            return false;
        }
        self.buid = Some(buid);
        true
    }

    pub fn add_rssi(&mut self, rssi: i32, at: DateTime<Utc>) {
        if self.samples.is_empty() {
            self.timestamp_start = at;
            self.timestamp_end = at;
        }
        self.samples.push(RssiSample {
            rssi,
            at,
            seq: NEXT_SAMPLE_SEQ.fetch_add(1, Ordering::Relaxed),
        });
        self.timestamp_end = self.timestamp_end.max(at);
    }

    /// Folds another session's samples into this one, keeping delivery order.
    pub fn absorb(&mut self, other: ScanSession) {
        if other.samples.is_empty() {
            return;
        }
        if self.samples.is_empty() {
            self.timestamp_start = other.timestamp_start;
            self.timestamp_end = other.timestamp_end;
        } else {
            self.timestamp_start = self.timestamp_start.min(other.timestamp_start);
            self.timestamp_end = self.timestamp_end.max(other.timestamp_end);
        }
        self.samples.extend(other.samples);
        self.samples.sort_by_key(|sample| sample.seq);
    }

    /// Drops samples that have been persisted; the window shrinks to what is left.
    pub fn drain_flushed(&mut self, flushed: &HashSet<u64>) {
        self.samples.retain(|sample| !flushed.contains(&sample.seq));
        if let Some(first) = self.samples.first() {
            self.timestamp_start = first.at;
        }
        if let Some(latest) = self.samples.iter().map(|sample| sample.at).max() {
            self.timestamp_end = latest;
        }
    }

    /// Starts a fresh window, keeping identity and mac.
    pub fn reset(&mut self, at: DateTime<Utc>) {
        self.samples.clear();
        self.timestamp_start = at;
        self.timestamp_end = at;
    }

    pub fn summary(&self) -> Option<RssiSummary> {
        let values: Vec<i32> = self.samples.iter().map(|sample| sample.rssi).collect();
        RssiSummary::from_samples(&values)
    }
}
