use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::models::Buid;

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} out of range: {value}"))
}

pub fn to_epoch_ms(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub fn from_epoch_ms(value: i64, field: &str) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(value)
        .ok_or_else(|| anyhow!("{field} holds out-of-range timestamp {value}"))
}

pub fn parse_buid(value: &str, field: &str) -> Result<Buid> {
    value
        .parse()
        .with_context(|| format!("failed to parse {field}"))
}
