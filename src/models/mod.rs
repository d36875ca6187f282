pub mod identity;

pub use identity::{Buid, MacAddress, BUID_LEN};
