//! Session / SessionPool (component #4, spec.md §4.3): a rotating bag of
//! credential/cookie holders with usage and health counters.
//!
//! A `Session` is shared (`Arc<Session>`) across whichever worker currently
//! holds it, so its mutable counters are plain atomics rather than the
//! ownership-consuming typestate used for [`crate::request::Request`] — the
//! pool hands out the *same* session object to be used repeatedly, it
//! doesn't move it between distinct owners. `retired` is the one bit that
//! matters for dispatch and is read far more often than it's written, hence
//! `AtomicBool` rather than a lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CrawlError, Result};
use crate::events::{CrawlerEvent, EventBus};

/// Stable identity of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Policy knobs for both individual sessions and the pool (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    pub max_pool_size: usize,
    pub max_usage_count: u32,
    pub max_error_score: u32,
    pub session_expiry: Duration,
    /// Response status codes that trigger `retire_on_blocked_status_codes`.
    pub blocked_status_codes: Vec<u16>,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            max_usage_count: 50,
            max_error_score: 3,
            session_expiry: Duration::from_secs(60 * 60),
            blocked_status_codes: vec![401, 403, 429],
        }
    }
}

/// A single rotating identity: cookies, usage/error counters, arbitrary
/// `userData`. `markGood`/`markBad`/`retire` mutate the shared instance in
/// place; callers never see a stale clone.
pub struct Session {
    id: SessionId,
    cookies: RwLock<HashMap<String, String>>,
    user_data: RwLock<serde_json::Value>,
    usage_count: AtomicU32,
    max_usage_count: u32,
    error_score: AtomicU32,
    max_error_score: u32,
    expires_at: DateTime<Utc>,
    retired: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("usage_count", &self.usage_count.load(Ordering::Relaxed))
            .field("error_score", &self.error_score.load(Ordering::Relaxed))
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .finish()
    }
}

impl Session {
    fn new(config: &SessionPoolConfig) -> Self {
        Self {
            id: SessionId::new(),
            cookies: RwLock::new(HashMap::new()),
            user_data: RwLock::new(serde_json::Value::Null),
            usage_count: AtomicU32::new(0),
            max_usage_count: config.max_usage_count,
            error_score: AtomicU32::new(0),
            max_error_score: config.max_error_score,
            expires_at: Utc::now() + chrono::Duration::from_std(config.session_expiry).unwrap_or_default(),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count.load(Ordering::Relaxed)
    }

    pub fn error_score(&self) -> u32 {
        self.error_score.load(Ordering::Relaxed)
    }

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.write().insert(name.into(), value.into());
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        self.cookies.read().clone()
    }

    pub fn set_user_data(&self, value: serde_json::Value) {
        *self.user_data.write() = value;
    }

    pub fn user_data(&self) -> serde_json::Value {
        self.user_data.read().clone()
    }

    /// Records one use of the session; retires it once usage is exhausted.
    /// Returns whether the session is still usable after this call.
    fn record_usage(&self) -> bool {
        let used = self.usage_count.fetch_add(1, Ordering::AcqRel) + 1;
        if used >= self.max_usage_count {
            self.retired.store(true, Ordering::Release);
        }
        !self.is_retired()
    }

    /// `markGood()`: decreases the error score (floor zero).
    pub fn mark_good(&self) {
        let _ = self
            .error_score
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(s.saturating_sub(1)));
    }

    /// `markBad()`: increases the error score; retires once it reaches the
    /// configured ceiling.
    pub fn mark_bad(&self) {
        let score = self.error_score.fetch_add(1, Ordering::AcqRel) + 1;
        if score >= self.max_error_score {
            self.retired.store(true, Ordering::Release);
        }
    }

    /// `retire()`: terminal, explicit.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// `retireOnBlockedStatusCodes(status)`.
    pub fn retire_on_blocked_status(&self, status: u16, config: &SessionPoolConfig) -> bool {
        if config.blocked_status_codes.contains(&status) {
            self.retire();
            true
        } else {
            false
        }
    }
}

/// Capped container of [`Session`]s with weighted-random selection biased
/// toward less-used sessions, to "encourage rotation" (spec.md §4.3).
pub struct SessionPool {
    config: SessionPoolConfig,
    sessions: RwLock<Vec<Arc<Session>>>,
    events: EventBus,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig, events: EventBus) -> Self {
        Self {
            config,
            sessions: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_retired(&self) {
        let mut sessions = self.sessions.write();
        let (keep, retired): (Vec<_>, Vec<_>) = sessions
            .drain(..)
            .partition(|s| !s.is_retired() && !s.is_expired());
        *sessions = keep;
        drop(sessions);
        for session in retired {
            self.events.emit(CrawlerEvent::SessionRetired(session.id()));
        }
    }

    /// `getSession()`: creates a new session while under `maxPoolSize`,
    /// otherwise picks a random non-retired session weighted toward
    /// remaining usage budget. Usage is recorded against the returned
    /// session before it's handed back.
    pub fn get_session(&self) -> Result<Arc<Session>> {
        self.evict_retired();

        {
            let sessions = self.sessions.read();
            if sessions.len() < self.config.max_pool_size {
                drop(sessions);
                let session = Arc::new(Session::new(&self.config));
                self.sessions.write().push(session.clone());
                session.record_usage();
                return Ok(session);
            }
        }

        let sessions = self.sessions.read();
        let eligible: Vec<&Arc<Session>> = sessions.iter().filter(|s| !s.is_retired()).collect();
        if eligible.is_empty() {
            return Err(CrawlError::TransientBackend(
                "session pool exhausted: no eligible sessions and pool is full".into(),
            ));
        }

        let weights: Vec<u32> = eligible
            .iter()
            .map(|s| s.max_usage_count.saturating_sub(s.usage_count()).max(1))
            .collect();
        let total: u32 = weights.iter().sum();
        let mut pick = rand::thread_rng().gen_range(0..total);
        let mut chosen = eligible[0];
        for (session, weight) in eligible.iter().zip(weights.iter()) {
            if pick < *weight {
                chosen = session;
                break;
            }
            pick -= weight;
        }

        chosen.record_usage();
        Ok(chosen.clone())
    }

    /// Snapshot of ids for persistence; full cookie/userData state is not
    /// carried across restarts (spec.md is silent on session durability —
    /// sessions are treated as ephemeral, re-created as the pool refills).
    pub fn persist_state(&self) -> Vec<SessionId> {
        self.sessions.read().iter().map(|s| s.id()).collect()
    }

    /// `teardown()`: retires every session, firing `session-retired` for
    /// each.
    pub fn teardown(&self) {
        for session in self.sessions.read().iter() {
            session.retire();
        }
        self.evict_retired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_are_created_until_pool_is_full() {
        let config = SessionPoolConfig {
            max_pool_size: 2,
            ..SessionPoolConfig::default()
        };
        let pool = SessionPool::new(config, EventBus::default());
        let a = pool.get_session().unwrap();
        let b = pool.get_session().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn session_retires_after_usage_exhausted() {
        let config = SessionPoolConfig {
            max_pool_size: 1,
            max_usage_count: 1,
            ..SessionPoolConfig::default()
        };
        let pool = SessionPool::new(config, EventBus::default());
        let session = pool.get_session().unwrap();
        assert!(session.is_retired());
    }

    #[test]
    fn session_retires_when_error_score_reaches_max() {
        let config = SessionPoolConfig {
            max_error_score: 2,
            ..SessionPoolConfig::default()
        };
        let session = Session::new(&config);
        session.mark_bad();
        assert!(!session.is_retired());
        session.mark_bad();
        assert!(session.is_retired());
    }

    #[test]
    fn mark_good_floors_at_zero() {
        let session = Session::new(&SessionPoolConfig::default());
        session.mark_good();
        assert_eq!(session.error_score(), 0);
    }

    #[test]
    fn retire_on_blocked_status_is_terminal_and_reported() {
        let config = SessionPoolConfig::default();
        let session = Session::new(&config);
        assert!(!session.retire_on_blocked_status(200, &config));
        assert!(session.retire_on_blocked_status(429, &config));
        assert!(session.is_retired());
    }

    #[test]
    fn teardown_retires_all_sessions_and_emits_events() {
        let config = SessionPoolConfig {
            max_pool_size: 3,
            ..SessionPoolConfig::default()
        };
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let pool = SessionPool::new(config, events);
        pool.get_session().unwrap();
        pool.get_session().unwrap();
        pool.teardown();
        assert!(pool.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            CrawlerEvent::SessionRetired(_)
        ));
    }

    #[test]
    fn pool_falls_back_to_rotation_once_full() {
        let config = SessionPoolConfig {
            max_pool_size: 1,
            max_usage_count: 100,
            ..SessionPoolConfig::default()
        };
        let pool = SessionPool::new(config, EventBus::default());
        let first = pool.get_session().unwrap();
        let second = pool.get_session().unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(pool.len(), 1);
    }
}
