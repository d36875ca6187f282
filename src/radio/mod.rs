pub mod adapter;
pub mod classifier;
pub mod events;
pub mod payload;
pub mod protocol;

pub use adapter::{RadioAdapter, ScanFilter};
pub use classifier::{classify, classify_background, Observation};
pub use events::{Advertisement, RadioEvent, ScanKind};
pub use payload::{extract_identity, AdvertisePayload};
pub use protocol::{IDENTITY_CHARACTERISTIC_UUID, SERVICE_UUID};
