use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::db::ScanRecord;
use crate::models::{Buid, MacAddress};

use super::session::ScanSession;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub type SessionId = u64;

/// Bookkeeping for a peer seen only through its radio address.
#[derive(Debug, Clone)]
struct HiddenPeer {
    session: SessionId,
    quarantined_until: Option<Instant>,
}

/// What the store thinks should happen after a hidden observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenDisposition {
    /// Identity still unknown and the mac is free to be (re)queued.
    NeedsResolution,
    /// Identity known; nothing to resolve.
    Tracked,
    /// Identity unknown but a recent attempt failed.
    Quarantined { until: Instant },
}

/// Records captured for persistence, plus enough to commit them afterwards.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub generation: u64,
    pub records: Vec<ScanRecord>,
    flushed: HashSet<u64>,
}

/// Live sessions for the current scanning period.
///
/// Sessions live in one arena; the identity map and the hidden-peer map hold
/// ids into it, so a resolved hidden peer and its identity entry share one session.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<SessionId, ScanSession>,
    by_identity: HashMap<Buid, SessionId>,
    hidden: HashMap<MacAddress, HiddenPeer>,
    listing: Vec<SessionId>,
    next_id: SessionId,
    generation: u64,
    in_flight: Option<u64>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, session: ScanSession) -> SessionId {
        self.next_id += 1;
        let id = self.next_id;
        self.sessions.insert(id, session);
        id
    }

    fn promote(&mut self, buid: Buid, id: SessionId) {
        self.by_identity.insert(buid, id);
        self.listing.push(id);
    }

    pub fn record_direct(&mut self, buid: Buid, mac: MacAddress, rssi: i32, at: DateTime<Utc>) {
        let id = match self.by_identity.get(&buid) {
            Some(id) => *id,
            None => {
                log_info!("Found new peer {buid} (mac {mac})");
                let id = self.insert(ScanSession::new(Some(buid), mac, at));
                self.promote(buid, id);
                id
            }
        };

        if let Some(session) = self.sessions.get_mut(&id) {
            session.add_rssi(rssi, at);
            log_debug!("Peer {buid} - RSSI {rssi}");
        }
    }

    pub fn record_hidden(
        &mut self,
        mac: MacAddress,
        rssi: i32,
        at: DateTime<Utc>,
        now: Instant,
    ) -> HiddenDisposition {
        let Some((previous, quarantined_until)) = self
            .hidden
            .get(&mac)
            .map(|peer| (peer.session, peer.quarantined_until))
        else {
            log_info!("Found new hidden peer, mac {mac}");
            let mut session = ScanSession::new(None, mac.clone(), at);
            session.add_rssi(rssi, at);
            let id = self.insert(session);
            self.hidden.insert(
                mac,
                HiddenPeer {
                    session: id,
                    quarantined_until: None,
                },
            );
            return HiddenDisposition::NeedsResolution;
        };

        let id = self.attach(previous);
        self.repoint(previous, id);

        let Some(session) = self.sessions.get_mut(&id) else {
            log_warn!("Hidden peer {mac} lost its session; tracking it afresh");
            self.hidden.remove(&mac);
            return self.record_hidden(mac, rssi, at, now);
        };
        session.add_rssi(rssi, at);
        if session.buid().is_some() {
            return HiddenDisposition::Tracked;
        }

        match quarantined_until {
            Some(until) if now < until => HiddenDisposition::Quarantined { until },
            Some(_) => {
                if let Some(peer) = self.hidden.get_mut(&mac) {
                    peer.quarantined_until = None;
                }
                log_debug!("Quarantine over for {mac}");
                HiddenDisposition::NeedsResolution
            }
            None => HiddenDisposition::NeedsResolution,
        }
    }

    /// Makes sure a resolved session is the one listed under its identity.
    ///
    /// If another session already owns the identity, the samples are merged
    /// into it and that session's id is returned; callers must repoint.
    fn attach(&mut self, id: SessionId) -> SessionId {
        let Some(buid) = self.sessions.get(&id).and_then(|session| session.buid()) else {
            return id;
        };

        match self.by_identity.get(&buid).copied() {
            None => {
                self.promote(buid, id);
                id
            }
            Some(existing) if existing == id => id,
            Some(existing) => {
                if let Some(duplicate) = self.sessions.remove(&id) {
                    if let Some(target) = self.sessions.get_mut(&existing) {
                        target.absorb(duplicate);
                    }
                }
                existing
            }
        }
    }

    /// Binds a hidden peer to the identity read over its connection.
    pub fn resolve_identity(&mut self, mac: &MacAddress, buid: Buid) -> bool {
        let Some(peer) = self.hidden.get_mut(mac) else {
            log_warn!("Resolved {buid} for untracked mac {mac}");
            return false;
        };
        peer.quarantined_until = None;
        let id = peer.session;

        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if !session.bind(buid) && session.buid() != Some(buid) {
            log_warn!(
                "Mac {mac} already bound to {:?}, ignoring {buid}",
                session.buid()
            );
            return false;
        }

        log_info!("Resolved mac {mac} to {buid}");
        let canonical = self.attach(id);
        self.repoint(id, canonical);
        true
    }

    fn repoint(&mut self, from: SessionId, to: SessionId) {
        if from == to {
            return;
        }
        for peer in self.hidden.values_mut() {
            if peer.session == from {
                peer.session = to;
            }
        }
    }

    pub fn is_unresolved(&self, mac: &MacAddress) -> bool {
        self.hidden
            .get(mac)
            .and_then(|peer| self.sessions.get(&peer.session))
            .map(|session| session.buid().is_none())
            .unwrap_or(false)
    }

    pub fn quarantine(&mut self, mac: &MacAddress, until: Instant) {
        if let Some(peer) = self.hidden.get_mut(mac) {
            peer.quarantined_until = Some(until);
        }
    }

    pub fn is_quarantined(&self, mac: &MacAddress, now: Instant) -> bool {
        self.hidden
            .get(mac)
            .and_then(|peer| peer.quarantined_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Clears every quarantine whose window has passed.
    pub fn lift_expired_quarantines(&mut self, now: Instant) -> Vec<MacAddress> {
        let mut lifted = Vec::new();
        for (mac, peer) in self.hidden.iter_mut() {
            if matches!(peer.quarantined_until, Some(until) if until <= now) {
                peer.quarantined_until = None;
                lifted.push(mac.clone());
            }
        }
        lifted
    }

    /// Forgets hidden peers with nothing left to track: an empty window, no
    /// running quarantine and no pending resolution. Resolved peers lose their
    /// mac binding too and are asked again if they come back.
    pub fn evict_idle_hidden(
        &mut self,
        now: Instant,
        pending: impl Fn(&MacAddress) -> bool,
    ) -> usize {
        let sessions = &self.sessions;
        let idle: Vec<MacAddress> = self
            .hidden
            .iter()
            .filter(|(mac, peer)| {
                let empty = sessions
                    .get(&peer.session)
                    .map(|session| session.rssi_count() == 0)
                    .unwrap_or(true);
                let locked = matches!(peer.quarantined_until, Some(until) if now < until);
                empty && !locked && !pending(mac)
            })
            .map(|(mac, _)| mac.clone())
            .collect();
        if idle.is_empty() {
            return 0;
        }

        for mac in &idle {
            self.hidden.remove(mac);
            log_debug!("Forgetting idle hidden peer {mac}");
        }
        let referenced: HashSet<SessionId> = self
            .by_identity
            .values()
            .chain(self.hidden.values().map(|peer| &peer.session))
            .copied()
            .collect();
        self.sessions.retain(|id, _| referenced.contains(id));
        idle.len()
    }

    pub fn next_quarantine_expiry(&self) -> Option<Instant> {
        self.hidden
            .values()
            .filter_map(|peer| peer.quarantined_until)
            .min()
    }

    pub fn quarantined_count(&self, now: Instant) -> usize {
        self.hidden
            .values()
            .filter(|peer| matches!(peer.quarantined_until, Some(until) if now < until))
            .count()
    }

    pub fn identity_count(&self) -> usize {
        self.by_identity.len()
    }

    pub fn hidden_count(&self) -> usize {
        self.hidden.len()
    }

    pub fn get(&self, buid: &Buid) -> Option<&ScanSession> {
        self.by_identity
            .get(buid)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn hidden_session(&self, mac: &MacAddress) -> Option<&ScanSession> {
        self.hidden
            .get(mac)
            .and_then(|peer| self.sessions.get(&peer.session))
    }

    /// Identity-keyed sessions in discovery order, then unresolved hidden ones.
    pub fn live_sessions(&self) -> Vec<&ScanSession> {
        let mut sessions: Vec<&ScanSession> = self
            .listing
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .collect();

        let mut unresolved: Vec<&ScanSession> = self
            .hidden
            .values()
            .filter_map(|peer| self.sessions.get(&peer.session))
            .filter(|session| session.buid().is_none())
            .collect();
        unresolved.sort_by(|a, b| a.mac().as_str().cmp(b.mac().as_str()));
        sessions.extend(unresolved);
        sessions
    }

    pub fn flush_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Summarizes every identity-keyed session with samples. Nothing is
    /// cleared until [`commit_flush`](Self::commit_flush) is called.
    pub fn prepare_flush(&mut self) -> Option<FlushBatch> {
        if self.in_flight.is_some() {
            return None;
        }

        let mut records = Vec::new();
        let mut flushed = HashSet::new();
        for id in &self.listing {
            let Some(session) = self.sessions.get(id) else {
                continue;
            };
            let (Some(buid), Some(summary)) = (session.buid(), session.summary()) else {
                continue;
            };
            records.push(ScanRecord {
                id: None,
                buid,
                timestamp_start: session.timestamp_start(),
                timestamp_end: session.timestamp_end(),
                avg_rssi: summary.avg_rssi,
                med_rssi: summary.med_rssi,
                rssi_count: summary.rssi_count,
            });
            flushed.extend(session.samples().iter().map(|sample| sample.seq));
        }

        self.generation += 1;
        self.in_flight = Some(self.generation);
        Some(FlushBatch {
            generation: self.generation,
            records,
            flushed,
        })
    }

    /// Drops persisted samples and closes the window.
    ///
    /// Identity entries go away unless they picked up samples while the batch
    /// was being written. Hidden peers survive with an empty window so their
    /// resolution and quarantine state carry over.
    pub fn commit_flush(&mut self, batch: &FlushBatch, at: DateTime<Utc>) -> bool {
        if self.in_flight != Some(batch.generation) {
            log_warn!("Ignoring stale flush generation {}", batch.generation);
            return false;
        }
        self.in_flight = None;

        for session in self.sessions.values_mut() {
            session.drain_flushed(&batch.flushed);
        }

        let sessions = &self.sessions;
        self.by_identity.retain(|_, id| {
            sessions
                .get(id)
                .map(|session| session.rssi_count() > 0)
                .unwrap_or(false)
        });
        let kept: HashSet<SessionId> = self.by_identity.values().copied().collect();
        self.listing.retain(|id| kept.contains(id));

        let hidden_ids: HashSet<SessionId> =
            self.hidden.values().map(|peer| peer.session).collect();
        for id in &hidden_ids {
            if kept.contains(id) {
                continue;
            }
            if let Some(session) = self.sessions.get_mut(id) {
                session.reset(at);
            }
        }

        self.sessions
            .retain(|id, _| kept.contains(id) || hidden_ids.contains(id));
        true
    }

    pub fn abort_flush(&mut self, batch: &FlushBatch) {
        if self.in_flight == Some(batch.generation) {
            self.in_flight = None;
        }
    }
}
