//! Connection-based identity resolution, one peer at a time.
//!
//! Entries are served strictly first-come-first-served. Only the head of
//! the queue may be running; it leaves the queue on its terminal step, and
//! the caller then starts the next one.

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

use crate::models::{Buid, MacAddress};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Cool-down after a failed attempt before a mac may be queued again.
pub const QUARANTINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connecting,
    Discovering,
    Reading,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub mac: MacAddress,
    pub running: bool,
    stage: Option<Stage>,
    started_at: Option<Instant>,
}

impl QueueEntry {
    fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            running: false,
            stage: None,
            started_at: None,
        }
    }
}

/// Connection-lifecycle callbacks relevant to the running entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Connected,
    ServicesDiscovered {
        success: bool,
        has_identity_characteristic: bool,
    },
    IdentityRead {
        value: Option<Vec<u8>>,
    },
    Disconnected,
    ConnectionFailed {
        status: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RequestRefused,
    ConnectionFailed(i32),
    Disconnected,
    ServiceDiscoveryFailed,
    CharacteristicMissing,
    InvalidIdentity,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Buid),
    Failed(FailureReason),
}

/// What the caller has to do next on behalf of the running entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The event was not for the running entry.
    Ignore,
    DiscoverServices(MacAddress),
    ReadIdentity(MacAddress),
    /// The entry left the queue; disconnect and act on the outcome.
    Finished {
        mac: MacAddress,
        resolution: Resolution,
    },
}

#[derive(Debug)]
pub struct ResolutionQueue {
    entries: VecDeque<QueueEntry>,
    timeout: Duration,
}

impl ResolutionQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.entries.iter().any(|entry| &entry.mac == mac)
    }

    pub fn running_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.running).count()
    }

    pub fn running(&self) -> Option<&MacAddress> {
        self.entries
            .front()
            .filter(|entry| entry.running)
            .map(|entry| &entry.mac)
    }

    /// Queues a mac unless it is already waiting or running.
    pub fn enqueue(&mut self, mac: MacAddress) -> bool {
        if self.contains(&mac) {
            return false;
        }
        log_debug!("Enqueued for identity resolution, mac {mac}");
        self.entries.push_back(QueueEntry::new(mac));
        true
    }

    /// Marks the head as running and hands back its mac to connect to.
    /// Returns `None` when the queue is empty or the head is already running.
    pub fn start_next(&mut self, now: Instant) -> Option<MacAddress> {
        let head = self.entries.front_mut()?;
        if head.running {
            log_debug!("Waiting for resolution of {} to finish", head.mac);
            return None;
        }
        head.running = true;
        head.stage = Some(Stage::Connecting);
        head.started_at = Some(now);
        Some(head.mac.clone())
    }

    fn finish(&mut self, resolution: Resolution) -> Step {
        match self.entries.pop_front() {
            Some(entry) => {
                if let Resolution::Failed(reason) = resolution {
                    log_warn!("Identity resolution for {} failed: {reason:?}", entry.mac);
                }
                Step::Finished {
                    mac: entry.mac,
                    resolution,
                }
            }
            None => Step::Ignore,
        }
    }

    /// Fails the running entry from outside the callback flow, e.g. when the
    /// radio refused to even issue the next request.
    pub fn abort(&mut self, mac: &MacAddress, reason: FailureReason) -> Step {
        if self.running() != Some(mac) {
            return Step::Ignore;
        }
        self.finish(Resolution::Failed(reason))
    }

    /// Advances the running entry. Events for any other mac are ignored,
    /// which also swallows the disconnect that follows a finished attempt.
    pub fn on_event(&mut self, mac: &MacAddress, event: GattEvent) -> Step {
        let stage = match self.entries.front() {
            Some(head) if head.running && &head.mac == mac => head.stage,
            _ => return Step::Ignore,
        };

        let next = match (stage, event) {
            (Some(Stage::Connecting), GattEvent::Connected) => {
                Some((Stage::Discovering, Step::DiscoverServices(mac.clone())))
            }
            (
                Some(Stage::Discovering),
                GattEvent::ServicesDiscovered {
                    success,
                    has_identity_characteristic,
                },
            ) => {
                if !success {
                    return self.finish(Resolution::Failed(FailureReason::ServiceDiscoveryFailed));
                }
                if !has_identity_characteristic {
                    return self.finish(Resolution::Failed(FailureReason::CharacteristicMissing));
                }
                Some((Stage::Reading, Step::ReadIdentity(mac.clone())))
            }
            (Some(Stage::Reading), GattEvent::IdentityRead { value }) => {
                let resolution = match value.as_deref().and_then(Buid::from_slice) {
                    Some(buid) => Resolution::Resolved(buid),
                    None => Resolution::Failed(FailureReason::InvalidIdentity),
                };
                return self.finish(resolution);
            }
            (_, GattEvent::Disconnected) => {
                return self.finish(Resolution::Failed(FailureReason::Disconnected));
            }
            (_, GattEvent::ConnectionFailed { status }) => {
                return self.finish(Resolution::Failed(FailureReason::ConnectionFailed(status)));
            }
            (stage, event) => {
                log_debug!("Ignoring {event:?} for {mac} in stage {stage:?}");
                None
            }
        };

        match next {
            Some((stage, step)) => {
                if let Some(head) = self.entries.front_mut() {
                    head.stage = Some(stage);
                }
                step
            }
            None => Step::Ignore,
        }
    }

    /// Gives up on a running head that has been silent for too long.
    pub fn expire(&mut self, now: Instant) -> Step {
        match self.head_deadline() {
            Some(deadline) if deadline <= now => {
                self.finish(Resolution::Failed(FailureReason::TimedOut))
            }
            _ => Step::Ignore,
        }
    }

    pub fn head_deadline(&self) -> Option<Instant> {
        self.entries
            .front()
            .filter(|entry| entry.running)
            .and_then(|entry| entry.started_at)
            .map(|started| started + self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(value: &str) -> MacAddress {
        MacAddress::new(value)
    }

    fn token() -> Vec<u8> {
        vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
    }

    fn queue() -> ResolutionQueue {
        ResolutionQueue::new(Duration::from_secs(30))
    }

    #[test]
    fn happy_path_walks_through_every_stage() {
        let mut q = queue();
        let now = Instant::now();
        assert!(q.enqueue(mac("m1")));
        assert_eq!(q.start_next(now), Some(mac("m1")));

        assert_eq!(
            q.on_event(&mac("m1"), GattEvent::Connected),
            Step::DiscoverServices(mac("m1"))
        );
        assert_eq!(
            q.on_event(
                &mac("m1"),
                GattEvent::ServicesDiscovered {
                    success: true,
                    has_identity_characteristic: true
                }
            ),
            Step::ReadIdentity(mac("m1"))
        );
        assert_eq!(
            q.on_event(&mac("m1"), GattEvent::IdentityRead { value: Some(token()) }),
            Step::Finished {
                mac: mac("m1"),
                resolution: Resolution::Resolved(Buid::from_slice(&token()).unwrap()),
            }
        );
        assert!(q.is_empty());
        assert_eq!(q.on_event(&mac("m1"), GattEvent::Disconnected), Step::Ignore);
    }

    #[test]
    fn only_the_head_ever_runs() {
        let mut q = queue();
        let now = Instant::now();
        for name in ["m1", "m2", "m3"] {
            q.enqueue(mac(name));
        }
        assert!(!q.enqueue(mac("m2")));

        assert_eq!(q.start_next(now), Some(mac("m1")));
        assert_eq!(q.start_next(now), None);
        assert_eq!(q.running_count(), 1);

        // events for a waiting entry do nothing
        assert_eq!(q.on_event(&mac("m2"), GattEvent::Connected), Step::Ignore);

        let step = q.on_event(&mac("m1"), GattEvent::ConnectionFailed { status: 133 });
        assert_eq!(
            step,
            Step::Finished {
                mac: mac("m1"),
                resolution: Resolution::Failed(FailureReason::ConnectionFailed(133)),
            }
        );
        assert_eq!(q.running_count(), 0);
        assert_eq!(q.start_next(now), Some(mac("m2")));
        assert_eq!(q.running(), Some(&mac("m2")));
        assert_eq!(q.running_count(), 1);
    }

    #[test]
    fn discovery_and_read_failures_are_terminal() {
        let now = Instant::now();
        let cases = vec![
            (
                GattEvent::ServicesDiscovered {
                    success: false,
                    has_identity_characteristic: true,
                },
                FailureReason::ServiceDiscoveryFailed,
                false,
            ),
            (
                GattEvent::ServicesDiscovered {
                    success: true,
                    has_identity_characteristic: false,
                },
                FailureReason::CharacteristicMissing,
                false,
            ),
            (
                GattEvent::IdentityRead { value: None },
                FailureReason::InvalidIdentity,
                true,
            ),
            (
                GattEvent::IdentityRead {
                    value: Some(vec![0; 10]),
                },
                FailureReason::InvalidIdentity,
                true,
            ),
            (
                GattEvent::IdentityRead {
                    value: Some(vec![1; 4]),
                },
                FailureReason::InvalidIdentity,
                true,
            ),
        ];

        for (event, reason, needs_read_stage) in cases {
            let mut q = queue();
            q.enqueue(mac("m1"));
            q.start_next(now);
            q.on_event(&mac("m1"), GattEvent::Connected);
            if needs_read_stage {
                q.on_event(
                    &mac("m1"),
                    GattEvent::ServicesDiscovered {
                        success: true,
                        has_identity_characteristic: true,
                    },
                );
            }
            assert_eq!(
                q.on_event(&mac("m1"), event),
                Step::Finished {
                    mac: mac("m1"),
                    resolution: Resolution::Failed(reason),
                }
            );
            assert!(q.is_empty());
        }
    }

    #[test]
    fn unexpected_disconnect_fails_the_head() {
        let mut q = queue();
        q.enqueue(mac("m1"));
        q.start_next(Instant::now());
        q.on_event(&mac("m1"), GattEvent::Connected);
        assert_eq!(
            q.on_event(&mac("m1"), GattEvent::Disconnected),
            Step::Finished {
                mac: mac("m1"),
                resolution: Resolution::Failed(FailureReason::Disconnected),
            }
        );
    }

    #[test]
    fn silent_head_times_out() {
        let mut q = ResolutionQueue::new(Duration::from_secs(10));
        let now = Instant::now();
        q.enqueue(mac("m1"));
        assert_eq!(q.head_deadline(), None);
        q.start_next(now);
        assert_eq!(q.head_deadline(), Some(now + Duration::from_secs(10)));

        assert_eq!(q.expire(now + Duration::from_secs(9)), Step::Ignore);
        assert_eq!(
            q.expire(now + Duration::from_secs(10)),
            Step::Finished {
                mac: mac("m1"),
                resolution: Resolution::Failed(FailureReason::TimedOut),
            }
        );
    }

    #[test]
    fn refused_request_pops_the_head() {
        let mut q = queue();
        q.enqueue(mac("m1"));
        assert_eq!(q.abort(&mac("m1"), FailureReason::RequestRefused), Step::Ignore);
        q.start_next(Instant::now());
        assert!(matches!(
            q.abort(&mac("m1"), FailureReason::RequestRefused),
            Step::Finished {
                resolution: Resolution::Failed(FailureReason::RequestRefused),
                ..
            }
        ));
        assert!(q.is_empty());
    }
}
