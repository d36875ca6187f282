pub mod broadcast;
pub mod controller;
pub mod engine;
mod loop_worker;
pub mod resolver;
pub mod session;
pub mod store;

pub use controller::ScannerController;
pub use engine::{ProximityCore, ScannerSnapshot, SessionView};
pub use resolver::QUARANTINE;
pub use session::{RssiSummary, ScanSession};
pub use store::FlushBatch;
