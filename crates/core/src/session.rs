//! Session records, TTL regimes, peer membership, host presence.
//!
//! Each session record lives behind its own [`parking_lot::Mutex`] inside a
//! concurrent map, so mutations on one session never serialize against
//! mutations on another — only operations touching the *same* session
//! contend. A logical [`Timer`] stands in for the wall clock: production
//! code drives it from a background thread once per second; tests drive it
//! directly, which makes multi-hour TTL scenarios (S4, S5) instant to run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::ids::generate_token;

const SWEEP_INTERVAL_SECS: u64 = 60;

/// Minimum and maximum `max_peers` a session may be created with.
const MIN_PEERS: usize = 2;
const MAX_PEERS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct TtlConfig {
    pub base_ttl_secs: u64,
    pub empty_timeout_secs: u64,
    pub abs_host_on_secs: u64,
    pub abs_host_off_secs: u64,
    pub host_grace_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            base_ttl_secs: 30 * 60,
            empty_timeout_secs: 5 * 60,
            abs_host_on_secs: 24 * 3600,
            abs_host_off_secs: 4 * 3600,
            host_grace_secs: 30 * 60,
        }
    }
}

/// A logical monotonic clock, in seconds. Production advances it from a
/// background thread tied to the wall clock; tests advance it directly.
struct Timer(AtomicU64);

impl Timer {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub connection_handle: String,
    pub session_id: String,
    pub is_initiator_role: bool,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub absolute_expires_at: u64,
    pub empty_since: Option<u64>,
    pub max_peers: usize,
    pub peers: Vec<Peer>,
    pub connected_pairs: u32,
    pub creator_user_id: String,
    pub host_connected: bool,
    pub host_last_seen: Option<u64>,
    pub is_locked: bool,
    pub is_host_only_sending: bool,
}

/// Why `add_peer` refused a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// Missing, or expired and evicted as a side effect of the attempt.
    NotFound,
    Locked,
    Full,
}

/// A pure function of host state; never cached except as a denormalized
/// write to `absolute_expires_at` under the session lock.
fn effective_absolute_max(session: &Session, ttl: &TtlConfig) -> u64 {
    if session.host_connected {
        session.created_at + ttl.abs_host_on_secs
    } else if let Some(last_seen) = session.host_last_seen {
        (last_seen + ttl.host_grace_secs).max(session.created_at + ttl.abs_host_off_secs)
    } else {
        session.created_at + ttl.abs_host_off_secs
    }
}

pub struct SessionRegistry {
    timer: Timer,
    ttl: TtlConfig,
    sessions: DashMap<String, Mutex<Session>, ahash::RandomState>,
    /// connection_handle -> session_id, for `peer_by_handle` and cleanup.
    peer_index: DashMap<String, String, ahash::RandomState>,
}

impl SessionRegistry {
    pub fn new(ttl: TtlConfig) -> Arc<Self> {
        let this = Arc::new(Self {
            timer: Timer::new(),
            ttl,
            sessions: DashMap::with_hasher(ahash::RandomState::new()),
            peer_index: DashMap::with_hasher(ahash::RandomState::new()),
        });

        let sweeper = this.clone();
        std::thread::spawn(move || {
            let mut ticks_since_sweep = 0u64;
            loop {
                std::thread::sleep(Duration::from_secs(1));
                sweeper.timer.add(1);
                ticks_since_sweep += 1;
                if ticks_since_sweep >= SWEEP_INTERVAL_SECS {
                    ticks_since_sweep = 0;
                    sweeper.sweep();
                }
            }
        });

        this
    }

    pub fn create(&self, creator_user_id: String, max_peers: usize) -> Session {
        let max_peers = max_peers.clamp(MIN_PEERS, MAX_PEERS);
        let now = self.timer.get();
        let id = generate_token();

        let absolute_expires_at = now + self.ttl.abs_host_off_secs;
        let session = Session {
            id: id.clone(),
            created_at: now,
            expires_at: (now + self.ttl.base_ttl_secs).min(absolute_expires_at),
            absolute_expires_at,
            empty_since: None,
            max_peers,
            peers: Vec::new(),
            connected_pairs: 0,
            creator_user_id,
            host_connected: false,
            host_last_seen: None,
            is_locked: false,
            is_host_only_sending: false,
        };

        self.sessions.insert(id, Mutex::new(session.clone()));
        session
    }

    /// The reaping gate: never returns an expired session. See spec §4.C.3.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let now = self.timer.get();
        let mut evict = false;
        let result = {
            let entry = self.sessions.get(session_id)?;
            let mut session = entry.lock();

            if session.connected_pairs > 0 {
                self.extend_locked(&mut session, now);
                Some(session.clone())
            } else if now > effective_absolute_max(&session, &self.ttl) || session.expires_at < now {
                evict = true;
                None
            } else {
                session.absolute_expires_at = effective_absolute_max(&session, &self.ttl);
                Some(session.clone())
            }
        };

        if evict {
            self.evict(session_id);
        }
        result
    }

    pub fn add_peer(&self, session_id: &str, connection_handle: String, user_id: Option<String>) -> Result<Peer, JoinError> {
        let now = self.timer.get();
        let mut evict = false;
        let mut host_just_joined: Option<String> = None;

        let result = {
            let Some(entry) = self.sessions.get(session_id) else {
                return Err(JoinError::NotFound);
            };
            let mut session = entry.lock();

            if now > effective_absolute_max(&session, &self.ttl) {
                evict = true;
                Err(JoinError::NotFound)
            } else if session.connected_pairs == 0 && session.expires_at < now {
                evict = true;
                Err(JoinError::NotFound)
            } else if session.peers.len() >= session.max_peers {
                Err(JoinError::Full)
            } else {
                let is_initiator_role = session.peers.is_empty();
                if !is_initiator_role && session.is_locked {
                    Err(JoinError::Locked)
                } else {
                    let peer = Peer {
                        connection_handle: connection_handle.clone(),
                        session_id: session_id.to_string(),
                        is_initiator_role,
                        user_id: user_id.clone(),
                    };
                    session.peers.push(peer.clone());

                    if user_id.as_deref() == Some(session.creator_user_id.as_str()) {
                        host_just_joined = user_id.clone();
                        self.update_host_presence_locked(&mut session, true, now);
                    }

                    self.extend_locked(&mut session, now);
                    self.clear_empty_locked(&mut session, now);
                    Ok(peer)
                }
            }
        };

        if evict {
            self.evict(session_id);
        } else if result.is_ok() {
            self.peer_index.insert(connection_handle, session_id.to_string());
        }
        let _ = host_just_joined;
        result
    }

    pub fn remove_peer(&self, session_id: &str, connection_handle: &str) {
        let now = self.timer.get();

        if let Some(entry) = self.sessions.get(session_id) {
            let mut session = entry.lock();

            let was_host = session
                .peers
                .iter()
                .any(|p| p.connection_handle == connection_handle && p.user_id.as_deref() == Some(session.creator_user_id.as_str()));

            session.peers.retain(|p| p.connection_handle != connection_handle);

            if was_host {
                self.update_host_presence_locked(&mut session, false, now);
            }
            if session.peers.is_empty() {
                self.mark_empty_locked(&mut session, now);
            }
        }

        self.peer_index.remove(connection_handle);
    }

    pub fn peers_in(&self, session_id: &str) -> Vec<Peer> {
        self.sessions.get(session_id).map(|entry| entry.lock().peers.clone()).unwrap_or_default()
    }

    pub fn peer_by_handle(&self, connection_handle: &str) -> Option<Peer> {
        let session_id = self.peer_index.get(connection_handle)?;
        let entry = self.sessions.get(session_id.as_str())?;
        let session = entry.lock();
        session.peers.iter().find(|p| p.connection_handle == connection_handle).cloned()
    }

    pub fn extend(&self, session_id: &str) {
        let now = self.timer.get();
        if let Some(entry) = self.sessions.get(session_id) {
            self.extend_locked(&mut entry.lock(), now);
        }
    }

    pub fn mark_empty(&self, session_id: &str) {
        let now = self.timer.get();
        if let Some(entry) = self.sessions.get(session_id) {
            self.mark_empty_locked(&mut entry.lock(), now);
        }
    }

    pub fn clear_empty(&self, session_id: &str) {
        let now = self.timer.get();
        if let Some(entry) = self.sessions.get(session_id) {
            self.clear_empty_locked(&mut entry.lock(), now);
        }
    }

    pub fn inc_connected_pairs(&self, session_id: &str) {
        let now = self.timer.get();
        if let Some(entry) = self.sessions.get(session_id) {
            let mut session = entry.lock();
            session.connected_pairs += 1;
            session.empty_since = None;
            self.extend_locked(&mut session, now);
        }
    }

    pub fn dec_connected_pairs(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut session = entry.lock();
            session.connected_pairs = session.connected_pairs.saturating_sub(1);
        }
    }

    pub fn is_creator(&self, session_id: &str, user_id: &str) -> bool {
        self.sessions.get(session_id).map(|entry| entry.lock().creator_user_id == user_id).unwrap_or(false)
    }

    pub fn lock(&self, session_id: &str, user_id: &str) -> bool {
        self.with_creator_check(session_id, user_id, |session| session.is_locked = true)
    }

    pub fn unlock(&self, session_id: &str, user_id: &str) -> bool {
        self.with_creator_check(session_id, user_id, |session| session.is_locked = false)
    }

    pub fn enable_host_only_sending(&self, session_id: &str, user_id: &str) -> bool {
        self.with_creator_check(session_id, user_id, |session| session.is_host_only_sending = true)
    }

    pub fn disable_host_only_sending(&self, session_id: &str, user_id: &str) -> bool {
        self.with_creator_check(session_id, user_id, |session| session.is_host_only_sending = false)
    }

    pub fn host_connection_handle(&self, session_id: &str) -> Option<String> {
        let entry = self.sessions.get(session_id)?;
        let session = entry.lock();
        session
            .peers
            .iter()
            .find(|p| p.user_id.as_deref() == Some(session.creator_user_id.as_str()))
            .map(|p| p.connection_handle.clone())
    }

    pub fn update_host_presence(&self, session_id: &str, user_id: &str, connecting: bool) {
        let now = self.timer.get();
        if let Some(entry) = self.sessions.get(session_id) {
            let mut session = entry.lock();
            if session.creator_user_id != user_id {
                return;
            }
            self.update_host_presence_locked(&mut session, connecting, now);
        }
    }

    fn with_creator_check(&self, session_id: &str, user_id: &str, mutate: impl FnOnce(&mut Session)) -> bool {
        let Some(entry) = self.sessions.get(session_id) else {
            return false;
        };
        let mut session = entry.lock();
        if session.creator_user_id != user_id {
            return false;
        }
        mutate(&mut session);
        true
    }

    fn extend_locked(&self, session: &mut Session, now: u64) {
        let absolute_max = effective_absolute_max(session, &self.ttl);
        session.absolute_expires_at = absolute_max;
        session.expires_at = now.saturating_add(self.ttl.base_ttl_secs).min(absolute_max);
        session.empty_since = None;
    }

    fn mark_empty_locked(&self, session: &mut Session, now: u64) {
        if session.empty_since.is_some() || session.connected_pairs != 0 {
            return;
        }
        session.expires_at = session.expires_at.min(now.saturating_add(self.ttl.empty_timeout_secs));
        session.empty_since = Some(now);
    }

    fn clear_empty_locked(&self, session: &mut Session, now: u64) {
        if session.empty_since.is_none() {
            return;
        }
        let absolute_max = effective_absolute_max(session, &self.ttl);
        session.absolute_expires_at = absolute_max;
        session.expires_at = now.saturating_add(self.ttl.base_ttl_secs).min(absolute_max);
        session.empty_since = None;
    }

    fn update_host_presence_locked(&self, session: &mut Session, connecting: bool, now: u64) {
        session.host_connected = connecting;
        session.host_last_seen = Some(now);

        let absolute_max = effective_absolute_max(session, &self.ttl);
        session.absolute_expires_at = absolute_max;
        if connecting {
            session.expires_at = now.saturating_add(self.ttl.base_ttl_secs).min(absolute_max);
        }
    }

    fn evict(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            self.peer_index.retain(|_, sid| sid != session_id);
            log::info!("session {session_id} expired or evicted");
        }
    }

    fn sweep(&self) {
        let now = self.timer.get();
        let mut to_evict = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value().lock();
            let absolute_max = effective_absolute_max(&session, &self.ttl);
            if absolute_max < now || (session.connected_pairs == 0 && session.expires_at < now) {
                to_evict.push(entry.key().clone());
            }
        }

        for id in to_evict {
            self.evict(&id);
        }
    }

    #[cfg(test)]
    fn new_for_test(ttl: TtlConfig) -> Arc<Self> {
        Arc::new(Self {
            timer: Timer::new(),
            ttl,
            sessions: DashMap::with_hasher(ahash::RandomState::new()),
            peer_index: DashMap::with_hasher(ahash::RandomState::new()),
        })
    }

    #[cfg(test)]
    fn advance(&self, secs: u64) {
        self.timer.add(secs);
    }

    #[cfg(test)]
    fn run_sweep_for_test(&self) {
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new_for_test(TtlConfig::default())
    }

    #[test]
    fn membership_never_exceeds_max_peers() {
        let reg = registry();
        let session = reg.create("host".into(), 2);
        assert!(reg.add_peer(&session.id, "p1".into(), None).is_ok());
        assert!(reg.add_peer(&session.id, "p2".into(), None).is_ok());
        assert_eq!(reg.add_peer(&session.id, "p3".into(), None), Err(JoinError::Full));
    }

    #[test]
    fn first_joiner_is_the_sole_initiator() {
        let reg = registry();
        let session = reg.create("host".into(), 10);
        let p1 = reg.add_peer(&session.id, "p1".into(), None).unwrap();
        let p2 = reg.add_peer(&session.id, "p2".into(), None).unwrap();
        assert!(p1.is_initiator_role);
        assert!(!p2.is_initiator_role);
    }

    #[test]
    fn locked_session_rejects_new_non_initiator_joins() {
        let reg = registry();
        let session = reg.create("U_c".into(), 10);
        reg.add_peer(&session.id, "p1".into(), Some("U_c".into())).unwrap();
        assert!(reg.lock(&session.id, "U_c"));
        assert_eq!(reg.add_peer(&session.id, "p2".into(), None), Err(JoinError::Locked));
    }

    #[test]
    fn host_connected_matches_creator_presence() {
        let reg = registry();
        let session = reg.create("U_c".into(), 10);
        assert!(!reg.get(&session.id).unwrap().host_connected);
        reg.add_peer(&session.id, "h".into(), Some("U_c".into())).unwrap();
        assert!(reg.get(&session.id).unwrap().host_connected);
        reg.remove_peer(&session.id, "h");
        assert!(!reg.get(&session.id).unwrap().host_connected);
    }

    #[test]
    fn host_ttl_extension_matches_scenario_s4() {
        let reg = registry();
        let session = reg.create("U_c".into(), 10);
        assert_eq!(reg.get(&session.id).unwrap().absolute_expires_at, 4 * 3600);

        reg.advance(10 * 60);
        reg.add_peer(&session.id, "h".into(), Some("U_c".into())).unwrap();
        // effective_absolute_max under the host-on regime is created_at + abs_host_on,
        // not join-time + abs_host_on: created_at is 0, so this is exactly 24h.
        assert_eq!(reg.get(&session.id).unwrap().absolute_expires_at, 24 * 3600);

        reg.advance(3 * 3600 - 10 * 60);
        reg.remove_peer(&session.id, "h");
        let after = reg.get(&session.id).unwrap();
        assert_eq!(after.absolute_expires_at, (3 * 3600 + 30 * 60).max(4 * 3600));
    }

    #[test]
    fn active_pairs_protect_against_normal_expiry() {
        let reg = registry();
        let session = reg.create("U_c".into(), 10);
        reg.add_peer(&session.id, "p1".into(), None).unwrap();
        reg.add_peer(&session.id, "p2".into(), None).unwrap();
        reg.inc_connected_pairs(&session.id);

        reg.advance(35 * 60);
        let refreshed = reg.get(&session.id).expect("active pair must not be reaped");
        assert!(refreshed.expires_at > 35 * 60);
    }

    #[test]
    fn empty_timeout_reaps_after_the_deadline() {
        let reg = registry();
        let session = reg.create("U_c".into(), 10);
        reg.add_peer(&session.id, "p1".into(), None).unwrap();
        reg.remove_peer(&session.id, "p1");

        reg.advance(5 * 60 + 1);
        reg.run_sweep_for_test();
        assert!(reg.get(&session.id).is_none());
    }

    #[test]
    fn get_never_returns_an_expired_session() {
        let reg = registry();
        let session = reg.create("U_c".into(), 10);
        reg.advance(4 * 3600 + 1);
        assert!(reg.get(&session.id).is_none());
    }
}
