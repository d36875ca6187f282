pub mod db;
pub mod models;
pub mod proximity;
pub mod radio;
pub mod settings;
mod utils;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::info;

pub use db::{Database, Exposure, ScanRecord};
pub use models::{Buid, MacAddress};
pub use proximity::{ScannerController, ScannerSnapshot};
pub use radio::{RadioAdapter, RadioEvent};
pub use settings::{ScannerSettings, SettingsStore};

const DATABASE_FILE: &str = "proxitrace.sqlite3";
const SETTINGS_FILE: &str = "settings.json";

/// Reads `RUST_LOG`, defaulting to info. Later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

pub struct AppState {
    pub db: Database,
    pub scanner: ScannerController,
    pub settings: SettingsStore,
}

impl AppState {
    /// Peers that were close enough for long enough within the retention window.
    pub async fn critical_exposures(&self, now: DateTime<Utc>) -> Result<Vec<Exposure>> {
        let exposure = self.settings.scanner()?.exposure;
        let since = now - Duration::days(i64::from(exposure.retention_days));
        self.db
            .query_critical(since, exposure.critical_rssi, exposure.critical_minutes)
            .await
    }
}

/// Opens storage and settings under `data_dir`, drops expired records and
/// starts the scanner loop on the current runtime.
pub async fn bootstrap(data_dir: &Path, radio: Box<dyn RadioAdapter>) -> Result<AppState> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let db = Database::new(data_dir.join(DATABASE_FILE))?;
    let settings = SettingsStore::new(data_dir.join(SETTINGS_FILE))?;
    let scanner_settings = settings.scanner()?;

    let pruned = db
        .prune_expired(Utc::now(), scanner_settings.exposure.retention_days)
        .await
        .context("failed to prune expired scan records")?;
    if pruned > 0 {
        info!("Pruned {pruned} expired scan records");
    }

    let scanner = ScannerController::spawn(radio, db.clone(), scanner_settings);
    info!("Proximity scanner ready");

    Ok(AppState {
        db,
        scanner,
        settings,
    })
}
