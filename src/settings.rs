use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

/// Radio scan duty cycle. Passed straight through to the radio stack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScanMode {
    Opportunistic,
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TxPower {
    UltraLow,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSettings {
    pub mode: ScanMode,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            mode: ScanMode::LowLatency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power: TxPower,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::LowLatency,
            tx_power: TxPower::High,
        }
    }
}

/// Thresholds for deciding which stored encounters count as risky.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExposureSettings {
    pub critical_rssi: i32,
    pub critical_minutes: u32,
    pub retention_days: u32,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            critical_rssi: -75,
            critical_minutes: 15,
            retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScannerSettings {
    pub scan: ScanSettings,
    pub advertise: AdvertiseSettings,
    pub exposure: ExposureSettings,
    /// A connection attempt with no terminal callback after this long is abandoned.
    pub resolution_timeout_secs: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan: ScanSettings::default(),
            advertise: AdvertiseSettings::default(),
            exposure: ExposureSettings::default(),
            resolution_timeout_secs: 30,
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<ScannerSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Ignoring malformed settings at {}: {err}", path.display());
                ScannerSettings::default()
            })
        } else {
            ScannerSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn scanner(&self) -> Result<ScannerSettings> {
        self.data
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| anyhow!("settings lock poisoned"))
    }

    pub fn update_scanner(&self, settings: ScannerSettings) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &ScannerSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("proxitrace-settings-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(temp_path()).unwrap();
        assert_eq!(store.scanner().unwrap(), ScannerSettings::default());
    }

    #[test]
    fn updates_are_written_through() {
        let path = temp_path();
        let store = SettingsStore::new(path.clone()).unwrap();

        let mut settings = ScannerSettings::default();
        settings.scan.mode = ScanMode::Balanced;
        settings.exposure.critical_rssi = -70;
        store.update_scanner(settings.clone()).unwrap();

        let reopened = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(reopened.scanner().unwrap(), settings);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let path = temp_path();
        fs::write(&path, r#"{"resolutionTimeoutSecs": 12}"#).unwrap();

        let store = SettingsStore::new(path.clone()).unwrap();
        let settings = store.scanner().unwrap();
        assert_eq!(settings.resolution_timeout_secs, 12);
        assert_eq!(settings.exposure, ExposureSettings::default());
        let _ = fs::remove_file(path);
    }
}
