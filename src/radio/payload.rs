//! Advertisement payload codec.
//!
//! Raw advertisements are a run of length-type-value records: a length byte
//! `L`, a type byte, then `L - 1` payload bytes. A zero length ends the run.

use serde::{Deserialize, Serialize};

use crate::models::{Buid, BUID_LEN};

use super::protocol::{
    service_uuid_le, AD_TYPE_COMPLETE_SERVICE_UUIDS_128, AD_TYPE_FLAGS, AD_TYPE_SERVICE_DATA_128,
    AD_TYPE_SERVICE_DATA_16, AD_TYPE_SERVICE_DATA_32, FLAGS_GENERAL_DISCOVERABLE,
};

/// Width of the service identifier that precedes the token for each service-data type.
fn embedded_uuid_width(ad_type: u8) -> Option<usize> {
    match ad_type {
        AD_TYPE_SERVICE_DATA_128 => Some(16),
        AD_TYPE_SERVICE_DATA_16 => Some(2),
        AD_TYPE_SERVICE_DATA_32 => Some(4),
        _ => None,
    }
}

/// Pulls the identity token out of an advertisement.
///
/// Scanning stops at the first service-data record. The token is the ten
/// bytes right after that record's embedded service identifier; if they
/// would run past the buffer, or are all zero, there is no identity.
pub fn extract_identity(bytes: &[u8]) -> Option<Buid> {
    let mut index = 0usize;

    while index < bytes.len() {
        let len = bytes[index] as usize;
        if len == 0 {
            break;
        }
        let Some(&ad_type) = bytes.get(index + 1) else {
            break;
        };

        if let Some(width) = embedded_uuid_width(ad_type) {
            let start = index + 2 + width;
            let end = start + BUID_LEN;
            return bytes.get(start..end).and_then(Buid::from_slice);
        }

        index += len + 1;
    }

    None
}

/// The two halves of an outbound advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisePayload {
    /// Flags plus the complete 128-bit service UUID list.
    pub advertisement: Vec<u8>,
    /// Service data record: service UUID followed by the identity token.
    pub scan_response: Vec<u8>,
}

impl AdvertisePayload {
    pub fn for_identity(buid: &Buid) -> Self {
        let uuid = service_uuid_le();

        let mut advertisement = vec![0x02, AD_TYPE_FLAGS, FLAGS_GENERAL_DISCOVERABLE];
        advertisement.push((1 + uuid.len()) as u8);
        advertisement.push(AD_TYPE_COMPLETE_SERVICE_UUIDS_128);
        advertisement.extend_from_slice(&uuid);

        let mut scan_response = Vec::with_capacity(2 + uuid.len() + BUID_LEN);
        scan_response.push((1 + uuid.len() + BUID_LEN) as u8);
        scan_response.push(AD_TYPE_SERVICE_DATA_128);
        scan_response.extend_from_slice(&uuid);
        scan_response.extend_from_slice(buid.as_bytes());

        Self {
            advertisement,
            scan_response,
        }
    }

    /// What a scanner sees once it has merged the advertisement and its scan response.
    pub fn scan_record(&self) -> Vec<u8> {
        let mut bytes = self.advertisement.clone();
        bytes.extend_from_slice(&self.scan_response);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> [u8; 10] {
        [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x00, 0x11, 0x22, 0x33, 0x44]
    }

    #[test]
    fn extracts_token_after_128_bit_service_data() {
        let mut bytes = vec![0x02, 0x01, 0x06, 0x11, 0x21];
        bytes.extend_from_slice(&service_uuid_le());
        bytes.extend_from_slice(&token());

        let buid = extract_identity(&bytes).expect("identity");
        assert_eq!(buid.to_string(), "aabbccddee0011223344");
    }

    #[test]
    fn extracts_token_after_16_and_32_bit_service_data() {
        let mut short = vec![0x0d, 0x16, 0x6f, 0xfd];
        short.extend_from_slice(&token());
        assert_eq!(extract_identity(&short), Buid::from_slice(&token()));

        let mut medium = vec![0x02, 0x01, 0x06, 0x0f, 0x20, 1, 2, 3, 4];
        medium.extend_from_slice(&token());
        assert_eq!(extract_identity(&medium), Buid::from_slice(&token()));
    }

    #[test]
    fn truncated_buffers_yield_none() {
        let mut bytes = vec![0x02, 0x01, 0x06, 0x11, 0x21];
        bytes.extend_from_slice(&service_uuid_le());
        bytes.extend_from_slice(&token());

        for cut in 0..bytes.len() {
            assert_eq!(extract_identity(&bytes[..cut]), None, "cut at {cut}");
        }
    }

    #[test]
    fn zero_token_yields_none() {
        let mut bytes = vec![0x11, 0x21];
        bytes.extend_from_slice(&service_uuid_le());
        bytes.extend_from_slice(&[0u8; 10]);
        assert_eq!(extract_identity(&bytes), None);
    }

    #[test]
    fn stops_at_zero_length_and_ignores_other_types() {
        let mut bytes = vec![0x03, 0xff, 0x4c, 0x00, 0x00, 0x11, 0x21];
        bytes.extend_from_slice(&service_uuid_le());
        bytes.extend_from_slice(&token());
        assert_eq!(extract_identity(&bytes), None);

        assert_eq!(extract_identity(&[0x05, 0xff, 0x4c, 0x00, 0x01, 0x02]), None);
        assert_eq!(extract_identity(&[0xff]), None);
        assert_eq!(extract_identity(&[]), None);
    }

    #[test]
    fn overrunning_service_data_record_ends_the_search() {
        let bytes = [0x03, 0x16, 0x6f, 0xfd, 0x05, 0xff, 0x01, 0x02, 0x03, 0x04];
        assert_eq!(extract_identity(&bytes), None);
    }

    #[test]
    fn advertised_payload_decodes_to_the_same_token() {
        let buid = Buid::from_slice(&token()).unwrap();
        let payload = AdvertisePayload::for_identity(&buid);

        assert_eq!(extract_identity(&payload.scan_response), Some(buid));
        assert_eq!(extract_identity(&payload.scan_record()), Some(buid));
        assert_eq!(extract_identity(&payload.advertisement), None);
        assert_eq!(payload.scan_response[0] as usize, payload.scan_response.len() - 1);
    }
}
