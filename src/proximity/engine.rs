use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::models::{Buid, MacAddress};
use crate::radio::protocol::APPLE_MANUFACTURER_ID;
use crate::radio::{
    classify, classify_background, Advertisement, Observation, RadioAdapter, RadioEvent,
    ScanFilter, ScanKind, SERVICE_UUID,
};
use crate::settings::ScannerSettings;

use super::broadcast::BroadcastController;
use super::resolver::{FailureReason, GattEvent, Resolution, ResolutionQueue, Step, QUARANTINE};
use super::store::{FlushBatch, HiddenDisposition, SessionStore};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub buid: Option<Buid>,
    pub mac: MacAddress,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub rssi_count: usize,
    pub last_rssi: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerSnapshot {
    pub bluetooth_enabled: bool,
    pub supports_advertising: bool,
    pub scanning: bool,
    pub background_scanning: bool,
    pub advertising: bool,
    pub last_scan_result_at: Option<DateTime<Utc>>,
    pub sessions: Vec<SessionView>,
    pub pending_resolutions: usize,
    pub resolving: Option<MacAddress>,
    pub quarantined: usize,
    pub flush_in_flight: bool,
}

/// Everything the proximity actor owns, driven one event at a time.
pub struct ProximityCore {
    store: SessionStore,
    queue: ResolutionQueue,
    broadcast: BroadcastController,
    settings: ScannerSettings,
    scanning: bool,
    background_scanning: bool,
    last_scan_result_at: Option<DateTime<Utc>>,
}

impl ProximityCore {
    pub fn new(settings: ScannerSettings) -> Self {
        let timeout = Duration::from_secs(settings.resolution_timeout_secs.max(1));
        Self {
            store: SessionStore::new(),
            queue: ResolutionQueue::new(timeout),
            broadcast: BroadcastController::new(),
            settings,
            scanning: false,
            background_scanning: false,
            last_scan_result_at: None,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn queue(&self) -> &ResolutionQueue {
        &self.queue
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn is_advertising(&self) -> bool {
        self.broadcast.is_advertising()
    }

    pub fn start_scanning(&mut self, radio: &mut dyn RadioAdapter) -> Result<()> {
        if self.scanning || self.background_scanning {
            log_info!("Restarting scanning");
            self.stop_scans(radio);
        }
        if !radio.is_enabled() {
            bail!("bluetooth disabled, can't start scanning");
        }

        log_info!("Starting scanning in mode {:?}", self.settings.scan.mode);
        radio
            .start_scan(
                ScanKind::Direct,
                &ScanFilter::ServiceUuid(SERVICE_UUID),
                &self.settings.scan,
            )
            .context("failed to start service scan")?;
        self.scanning = true;

        match radio.start_scan(
            ScanKind::Background,
            &ScanFilter::ManufacturerData(APPLE_MANUFACTURER_ID),
            &self.settings.scan,
        ) {
            Ok(()) => self.background_scanning = true,
            Err(err) => log_warn!("Background scan unavailable: {err:#}"),
        }
        Ok(())
    }

    fn stop_scans(&mut self, radio: &mut dyn RadioAdapter) {
        self.scanning = false;
        self.background_scanning = false;
        radio.stop_scan(ScanKind::Direct);
        radio.stop_scan(ScanKind::Background);
    }

    /// Halts both scans and hands back the batch to persist. Safe to repeat.
    pub fn stop_scanning(&mut self, radio: &mut dyn RadioAdapter) -> Option<FlushBatch> {
        log_info!("Stopping scanning");
        self.stop_scans(radio);
        self.prepare_flush()
    }

    pub fn start_advertising(&mut self, buid: Buid, radio: &mut dyn RadioAdapter) -> Result<()> {
        let settings = self.settings.advertise.clone();
        self.broadcast.start(buid, radio, &settings)
    }

    pub fn stop_advertising(&mut self, radio: &mut dyn RadioAdapter) {
        self.broadcast.stop(radio);
    }

    pub fn prepare_flush(&mut self) -> Option<FlushBatch> {
        let batch = self.store.prepare_flush();
        if batch.is_none() {
            log_warn!("Flush already in progress");
        }
        batch
    }

    /// Closes the flushed window, then forgets hidden peers left with nothing to track.
    pub fn commit_flush(&mut self, batch: &FlushBatch, at: DateTime<Utc>, now: Instant) -> bool {
        if !self.store.commit_flush(batch, at) {
            return false;
        }
        self.evict_idle(now);
        true
    }

    fn evict_idle(&mut self, now: Instant) {
        let queue = &self.queue;
        let evicted = self.store.evict_idle_hidden(now, |mac| queue.contains(mac));
        if evicted > 0 {
            log_debug!("Forgot {evicted} idle hidden peers");
        }
    }

    pub fn abort_flush(&mut self, batch: &FlushBatch) {
        self.store.abort_flush(batch);
    }

    pub fn handle_event(&mut self, event: RadioEvent, radio: &mut dyn RadioAdapter, now: Instant) {
        match event {
            RadioEvent::ScanResult {
                scan,
                advertisement,
            } => self.on_advertisement(scan, advertisement, radio, now),
            RadioEvent::BatchScanResults {
                scan,
                advertisements,
            } => {
                for advertisement in advertisements {
                    self.on_advertisement(scan, advertisement, radio, now);
                }
            }
            RadioEvent::ScanFailed { scan, code } => {
                log_error!("Scan {scan:?} failed with error {code}");
                match scan {
                    ScanKind::Direct => self.scanning = false,
                    ScanKind::Background => self.background_scanning = false,
                }
                radio.stop_scan(scan);
            }
            RadioEvent::AdvertiseStarted => self.broadcast.on_started(),
            RadioEvent::AdvertiseFailed { code } => self.broadcast.on_failed(code),
            RadioEvent::Connected { mac } => self.on_gatt(mac, GattEvent::Connected, radio, now),
            RadioEvent::Disconnected { mac } => {
                self.on_gatt(mac, GattEvent::Disconnected, radio, now)
            }
            RadioEvent::ServicesDiscovered {
                mac,
                success,
                has_identity_characteristic,
            } => self.on_gatt(
                mac,
                GattEvent::ServicesDiscovered {
                    success,
                    has_identity_characteristic,
                },
                radio,
                now,
            ),
            RadioEvent::IdentityRead { mac, value } => {
                self.on_gatt(mac, GattEvent::IdentityRead { value }, radio, now)
            }
            RadioEvent::ConnectionFailed { mac, status } => {
                self.on_gatt(mac, GattEvent::ConnectionFailed { status }, radio, now)
            }
        }
    }

    fn on_advertisement(
        &mut self,
        scan: ScanKind,
        advertisement: Advertisement,
        radio: &mut dyn RadioAdapter,
        now: Instant,
    ) {
        self.last_scan_result_at = Some(advertisement.observed_at);

        let observation = match scan {
            ScanKind::Direct => classify(&advertisement.bytes, &advertisement.service_uuids),
            ScanKind::Background => {
                classify_background(&advertisement.bytes, &advertisement.service_uuids)
            }
        };

        let Advertisement {
            mac,
            rssi,
            observed_at,
            ..
        } = advertisement;

        match observation {
            Observation::Direct {
                identity: Some(buid),
            } => self.store.record_direct(buid, mac, rssi, observed_at),
            Observation::Direct { identity: None } | Observation::HiddenCandidate => {
                self.on_hidden(mac, rssi, observed_at, radio, now)
            }
            Observation::Irrelevant => {}
        }
    }

    fn on_hidden(
        &mut self,
        mac: MacAddress,
        rssi: i32,
        at: DateTime<Utc>,
        radio: &mut dyn RadioAdapter,
        now: Instant,
    ) {
        match self.store.record_hidden(mac.clone(), rssi, at, now) {
            HiddenDisposition::NeedsResolution => {
                if self.queue.enqueue(mac) {
                    self.pump(radio, now);
                }
            }
            HiddenDisposition::Quarantined { until } => {
                log_debug!(
                    "Mac {mac} locked for another {}ms",
                    until.saturating_duration_since(now).as_millis()
                );
            }
            HiddenDisposition::Tracked => {}
        }
    }

    fn on_gatt(
        &mut self,
        mac: MacAddress,
        event: GattEvent,
        radio: &mut dyn RadioAdapter,
        now: Instant,
    ) {
        let step = self.queue.on_event(&mac, event);
        self.apply(step, radio, now);
    }

    fn apply(&mut self, step: Step, radio: &mut dyn RadioAdapter, now: Instant) {
        match step {
            Step::Ignore => {}
            Step::DiscoverServices(mac) => {
                if let Err(err) = radio.discover_services(&mac) {
                    log_warn!("Service discovery request for {mac} failed: {err:#}");
                    let step = self.queue.abort(&mac, FailureReason::RequestRefused);
                    self.apply(step, radio, now);
                }
            }
            Step::ReadIdentity(mac) => {
                if let Err(err) = radio.read_identity(&mac) {
                    log_warn!("Identity read request for {mac} failed: {err:#}");
                    let step = self.queue.abort(&mac, FailureReason::RequestRefused);
                    self.apply(step, radio, now);
                }
            }
            Step::Finished { mac, resolution } => {
                self.settle(&mac, resolution, radio, now);
                self.pump(radio, now);
            }
        }
    }

    fn settle(
        &mut self,
        mac: &MacAddress,
        resolution: Resolution,
        radio: &mut dyn RadioAdapter,
        now: Instant,
    ) {
        radio.disconnect(mac);
        match resolution {
            Resolution::Resolved(buid) => {
                self.store.resolve_identity(mac, buid);
            }
            Resolution::Failed(_) => {
                if self.store.is_unresolved(mac) {
                    log_info!("Locking mac {mac} for {}s", QUARANTINE.as_secs());
                    self.store.quarantine(mac, now + QUARANTINE);
                }
            }
        }
    }

    /// Starts the queue head if nothing is running. Heads whose connect
    /// request is refused are settled on the spot and the next one is tried.
    fn pump(&mut self, radio: &mut dyn RadioAdapter, now: Instant) {
        while let Some(mac) = self.queue.start_next(now) {
            log_info!("Connecting to {mac} for identity");
            match radio.connect(&mac) {
                Ok(()) => break,
                Err(err) => {
                    log_warn!("Connect request for {mac} failed: {err:#}");
                    if let Step::Finished { mac, resolution } =
                        self.queue.abort(&mac, FailureReason::RequestRefused)
                    {
                        self.settle(&mac, resolution, radio, now);
                    }
                }
            }
        }
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) has work to do.
    /// Quarantine expiry only counts while scanning.
    pub fn next_deadline(&self) -> Option<Instant> {
        let quarantine = if self.scanning {
            self.store.next_quarantine_expiry()
        } else {
            None
        };
        match (self.queue.head_deadline(), quarantine) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_tick(&mut self, radio: &mut dyn RadioAdapter, now: Instant) {
        for mac in self.store.lift_expired_quarantines(now) {
            log_debug!("Unlocking mac {mac}");
        }
        self.evict_idle(now);
        let step = self.queue.expire(now);
        self.apply(step, radio, now);
    }

    pub fn snapshot(&self, radio: &dyn RadioAdapter, now: Instant) -> ScannerSnapshot {
        let sessions = self
            .store
            .live_sessions()
            .into_iter()
            .map(|session| SessionView {
                buid: session.buid(),
                mac: session.mac().clone(),
                timestamp_start: session.timestamp_start(),
                timestamp_end: session.timestamp_end(),
                rssi_count: session.rssi_count(),
                last_rssi: session.last_rssi(),
            })
            .collect();

        ScannerSnapshot {
            bluetooth_enabled: radio.is_enabled(),
            supports_advertising: radio.supports_advertising(),
            scanning: self.scanning,
            background_scanning: self.background_scanning,
            advertising: self.broadcast.is_advertising(),
            last_scan_result_at: self.last_scan_result_at,
            sessions,
            pending_resolutions: self.queue.len(),
            resolving: self.queue.running().cloned(),
            quarantined: self.store.quarantined_count(now),
            flush_in_flight: self.store.flush_in_flight(),
        }
    }
}
