use anyhow::{bail, Context, Result};

use crate::models::Buid;
use crate::radio::{AdvertisePayload, RadioAdapter};
use crate::settings::AdvertiseSettings;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// Outbound advertising of the local identity.
#[derive(Debug, Default)]
pub struct BroadcastController {
    advertising: bool,
    pending: bool,
}

impl BroadcastController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Requests advertising; the flag flips once the radio confirms.
    pub fn start(
        &mut self,
        buid: Buid,
        radio: &mut dyn RadioAdapter,
        settings: &AdvertiseSettings,
    ) -> Result<()> {
        if self.advertising || self.pending {
            self.stop(radio);
        }
        if !radio.is_enabled() {
            bail!("bluetooth disabled, can't start advertising");
        }
        if !radio.supports_advertising() {
            bail!("radio does not support advertising");
        }

        log_info!(
            "Starting advertising as {buid} ({:?}, {:?})",
            settings.mode,
            settings.tx_power
        );
        let payload = AdvertisePayload::for_identity(&buid);
        radio
            .start_advertising(&payload, settings)
            .context("failed to request advertising")?;
        self.pending = true;
        Ok(())
    }

    pub fn stop(&mut self, radio: &mut dyn RadioAdapter) {
        log_info!("Stopping advertising");
        self.advertising = false;
        self.pending = false;
        radio.stop_advertising();
    }

    pub fn on_started(&mut self) {
        if !self.pending {
            return;
        }
        log_info!("Advertising started");
        self.pending = false;
        self.advertising = true;
    }

    /// No retry; the caller has to start again.
    pub fn on_failed(&mut self, code: i32) {
        log_error!("Advertising failed: {code}");
        self.pending = false;
        self.advertising = false;
    }
}
