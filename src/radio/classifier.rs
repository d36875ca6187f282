use uuid::Uuid;

use crate::models::Buid;

use super::payload::extract_identity;
use super::protocol::{HIDDEN_PATTERN_OFFSETS, HIDDEN_PATTERN_VALUES, SERVICE_UUID};

/// What an advertisement tells us about the peer behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The peer is ours. `identity` is present when the token was in the payload;
    /// otherwise the peer only declared the service and must be asked over a connection.
    Direct { identity: Option<Buid> },
    /// Looks like a backgrounded peer hiding both service and token.
    HiddenCandidate,
    Irrelevant,
}

fn declares_service(service_uuids: &[Uuid]) -> bool {
    service_uuids.contains(&SERVICE_UUID)
}

fn matches_hidden_pattern(bytes: &[u8]) -> bool {
    HIDDEN_PATTERN_OFFSETS
        .iter()
        .zip(HIDDEN_PATTERN_VALUES.iter())
        .all(|(&offset, &value)| bytes.get(offset) == Some(&value))
}

/// Classification for results of the service-filtered scan.
pub fn classify(bytes: &[u8], service_uuids: &[Uuid]) -> Observation {
    if let Some(identity) = extract_identity(bytes) {
        return Observation::Direct {
            identity: Some(identity),
        };
    }
    if declares_service(service_uuids) {
        return Observation::Direct { identity: None };
    }
    if matches_hidden_pattern(bytes) {
        return Observation::HiddenCandidate;
    }
    Observation::Irrelevant
}

/// Classification for results of the unfiltered background scan. Anything
/// declaring the service is left to the filtered scan so it is not handled twice.
pub fn classify_background(bytes: &[u8], service_uuids: &[Uuid]) -> Observation {
    if !declares_service(service_uuids) && matches_hidden_pattern(bytes) {
        Observation::HiddenCandidate
    } else {
        Observation::Irrelevant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::payload::AdvertisePayload;

    fn hidden_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; 40];
        bytes[0] = 0x1a;
        bytes[1] = 0xff;
        bytes[2] = 0x4c;
        bytes[29] = 0x00;
        bytes[30] = 0x02;
        bytes[31] = 0x00;
        bytes
    }

    #[test]
    fn token_in_payload_is_direct() {
        let buid: Buid = "aabbccddee0011223344".parse().unwrap();
        let bytes = AdvertisePayload::for_identity(&buid).scan_record();
        assert_eq!(
            classify(&bytes, &[SERVICE_UUID]),
            Observation::Direct {
                identity: Some(buid)
            }
        );
        assert_eq!(
            classify(&bytes, &[]),
            Observation::Direct {
                identity: Some(buid)
            }
        );
    }

    #[test]
    fn declared_service_without_token_needs_resolution() {
        assert_eq!(
            classify(&[0x02, 0x01, 0x06], &[SERVICE_UUID]),
            Observation::Direct { identity: None }
        );
    }

    #[test]
    fn hidden_pattern_is_candidate_only_when_direct_fails() {
        assert_eq!(classify(&hidden_bytes(), &[]), Observation::HiddenCandidate);

        let mut short = hidden_bytes();
        short.truncate(31);
        assert_eq!(classify(&short, &[]), Observation::Irrelevant);

        let mut wrong = hidden_bytes();
        wrong[30] = 0x01;
        assert_eq!(classify(&wrong, &[]), Observation::Irrelevant);
    }

    #[test]
    fn background_scan_skips_declared_service() {
        assert_eq!(
            classify_background(&hidden_bytes(), &[]),
            Observation::HiddenCandidate
        );
        assert_eq!(
            classify_background(&hidden_bytes(), &[SERVICE_UUID]),
            Observation::Irrelevant
        );
        assert_eq!(
            classify_background(&[0x02, 0x01, 0x06], &[]),
            Observation::Irrelevant
        );
    }
}
