use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const BUID_LEN: usize = 10;

/// Identity token a peer broadcasts (or serves over its identity characteristic).
///
/// Displayed and stored as 20 lower-case hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Buid([u8; BUID_LEN]);

impl Buid {
    pub fn new(bytes: [u8; BUID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a token from a raw slice. Anything that is not exactly ten
    /// non-zero-filled bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; BUID_LEN] = bytes.try_into().ok()?;
        if raw.iter().all(|b| *b == 0) {
            return None;
        }
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; BUID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Buid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Buid {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let bytes = hex::decode(value).with_context(|| format!("invalid BUID hex '{value}'"))?;
        if bytes.len() != BUID_LEN {
            bail!("BUID must be {BUID_LEN} bytes, got {}", bytes.len());
        }
        Self::from_slice(&bytes).ok_or_else(|| anyhow!("BUID '{value}' is all zeroes"))
    }
}

impl Serialize for Buid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Buid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Transient radio address. Peers rotate these, so it is never used as an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MacAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
