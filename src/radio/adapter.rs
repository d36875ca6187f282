use anyhow::Result;
use uuid::Uuid;

use crate::models::MacAddress;
use crate::settings::{AdvertiseSettings, ScanSettings};

use super::events::ScanKind;
use super::payload::AdvertisePayload;

/// Hardware filter applied to a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    ServiceUuid(Uuid),
    ManufacturerData(u16),
}

/// The platform radio stack.
///
/// Every call only *requests* an operation; outcomes come back later as
/// [`RadioEvent`](super::events::RadioEvent)s through the controller. A
/// returned error means the request could not even be issued.
pub trait RadioAdapter: Send {
    fn is_enabled(&self) -> bool;

    fn supports_advertising(&self) -> bool;

    fn start_scan(&mut self, kind: ScanKind, filter: &ScanFilter, settings: &ScanSettings)
        -> Result<()>;

    /// Must tolerate stopping a scan that is not running.
    fn stop_scan(&mut self, kind: ScanKind);

    fn start_advertising(
        &mut self,
        payload: &AdvertisePayload,
        settings: &AdvertiseSettings,
    ) -> Result<()>;

    fn stop_advertising(&mut self);

    fn connect(&mut self, mac: &MacAddress) -> Result<()>;

    fn discover_services(&mut self, mac: &MacAddress) -> Result<()>;

    /// Requests a read of the identity characteristic under the service UUID.
    fn read_identity(&mut self, mac: &MacAddress) -> Result<()>;

    /// Disconnects and releases the connection; tolerant of unknown macs.
    fn disconnect(&mut self, mac: &MacAddress);
}
