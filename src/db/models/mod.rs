pub mod scan_record;

pub use scan_record::{Exposure, ScanRecord};
