//! Per-connection session record.
//!
//! A [`Session`] is shared between its connection task (which owns the socket)
//! and the game loop (which decides what to send). Everything mutable sits
//! behind atomics or a short-lived mutex.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::entity::EntityId;
use crate::persistence::PlayerId;

pub type SessionId = u64;

/// Consecutive protocol errors or rate-limit drops before a forced disconnect.
pub const MAX_VIOLATIONS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Connected,
    Authenticated,
    Closing,
    Closed,
}

/// Token bucket: holds at most `capacity` tokens, refilled continuously at
/// `refill_per_sec`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(refill_per_sec: f64, capacity: u32) -> Self {
        Self::starting_at(refill_per_sec, capacity, Instant::now())
    }

    pub fn starting_at(refill_per_sec: f64, capacity: u32, now: Instant) -> Self {
        let capacity = capacity as f64;
        Self { capacity, refill_per_sec: refill_per_sec.max(0.0), tokens: capacity, last_refill: now }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).clamp(0.0, self.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Spend one token if available.
    pub fn try_take_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn try_take(&mut self) -> bool {
        self.try_take_at(Instant::now())
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub rate_limit_exceeded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionMetrics {
    pub connected_secs: f64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub rate_limit_exceeded: u64,
    /// Messages per second over the session's lifetime.
    pub receive_rate: f64,
    pub send_rate: f64,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    remote: SocketAddr,
    connected_at: Instant,
    outbound: mpsc::Sender<String>,
    closer: Notify,
    close_reason: Mutex<Option<String>>,
    state: Mutex<SessionState>,
    player: Mutex<Option<(PlayerId, EntityId)>>,
    groups: Mutex<HashSet<String>>,
    bucket: Mutex<TokenBucket>,
    last_activity: Mutex<Instant>,
    ping_outstanding: AtomicBool,
    violations: AtomicU32,
    data: Mutex<HashMap<String, Value>>,
    properties: Mutex<HashMap<String, String>>,
    pub stats: SessionStats,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        remote: SocketAddr,
        outbound: mpsc::Sender<String>,
        bucket: TokenBucket,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote,
            connected_at: now,
            outbound,
            closer: Notify::new(),
            close_reason: Mutex::new(None),
            state: Mutex::new(SessionState::Connecting),
            player: Mutex::new(None),
            groups: Mutex::new(HashSet::new()),
            bucket: Mutex::new(bucket),
            last_activity: Mutex::new(now),
            ping_outstanding: AtomicBool::new(false),
            violations: AtomicU32::new(0),
            data: Mutex::new(HashMap::new()),
            properties: Mutex::new(HashMap::new()),
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state poisoned") = state;
    }

    /// Move to `next` unless the session is already closing or closed.
    pub(crate) fn advance_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().expect("session state poisoned");
        if matches!(*state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        *state = next;
        true
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    pub fn player(&self) -> Option<(PlayerId, EntityId)> {
        *self.player.lock().expect("session player poisoned")
    }

    pub(crate) fn set_player(&self, player: Option<(PlayerId, EntityId)>) {
        *self.player.lock().expect("session player poisoned") = player;
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        self.player().map(|(_, e)| e)
    }

    pub fn groups(&self) -> Vec<String> {
        let mut out: Vec<String> = self.groups.lock().expect("session groups poisoned").iter().cloned().collect();
        out.sort();
        out
    }

    pub(crate) fn groups_mut(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.groups.lock().expect("session groups poisoned")
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Queue a JSON message. A full write queue closes the session.
    pub fn send(&self, msg: &Value) -> bool {
        let mut line = msg.to_string();
        line.push('\n');
        self.send_line(line)
    }

    /// Queue an already-terminated line.
    pub fn send_line(&self, line: String) -> bool {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return false;
        }
        match self.outbound.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Session {} write queue overflow, disconnecting", self.id);
                self.close("write queue overflow");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue an opaque payload as `BINARY:<hex>`.
    pub fn send_binary(&self, payload: &[u8]) -> bool {
        self.send_line(format!("BINARY:{}\n", hex::encode(payload)))
    }

    // ── Closing ─────────────────────────────────────────────────────────

    /// Ask the connection task to flush what is queued and drop the socket.
    pub fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        *self.close_reason.lock().expect("session close reason poisoned") = Some(reason.to_string());
        tracing::debug!("Closing session {}: {}", self.id, reason);
        self.closer.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closer.notified().await
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().expect("session close reason poisoned").clone()
    }

    // ── Activity, rate limit, violations ────────────────────────────────

    pub fn touch(&self) {
        *self.last_activity.lock().expect("session activity poisoned") = Instant::now();
        self.ping_outstanding.store(false, Relaxed);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock().expect("session activity poisoned"))
    }

    /// Marks a heartbeat ping as sent. Returns false if one already is.
    pub(crate) fn mark_pinged(&self) -> bool {
        !self.ping_outstanding.swap(true, Relaxed)
    }

    pub fn try_consume(&self) -> bool {
        self.try_consume_at(Instant::now())
    }

    pub fn try_consume_at(&self, now: Instant) -> bool {
        let ok = self.bucket.lock().expect("session bucket poisoned").try_take_at(now);
        if !ok {
            self.stats.rate_limit_exceeded.fetch_add(1, Relaxed);
        }
        ok
    }

    /// Count a protocol error or rate-limit drop. Closes the session when the
    /// consecutive count reaches [`MAX_VIOLATIONS`].
    pub fn record_violation(&self) -> u32 {
        let n = self.violations.fetch_add(1, Relaxed) + 1;
        if n >= MAX_VIOLATIONS {
            self.close("too many protocol violations");
        }
        n
    }

    pub fn clear_violations(&self) {
        self.violations.store(0, Relaxed);
    }

    pub fn note_received(&self, bytes: usize) {
        self.stats.messages_received.fetch_add(1, Relaxed);
        self.stats.bytes_received.fetch_add(bytes as u64, Relaxed);
    }

    pub fn note_sent(&self, bytes: usize) {
        self.stats.messages_sent.fetch_add(1, Relaxed);
        self.stats.bytes_sent.fetch_add(bytes as u64, Relaxed);
    }

    pub fn metrics(&self) -> SessionMetrics {
        let secs = self.connected_at.elapsed().as_secs_f64();
        let rx = self.stats.messages_received.load(Relaxed);
        let tx = self.stats.messages_sent.load(Relaxed);
        let rate = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        SessionMetrics {
            connected_secs: secs,
            messages_received: rx,
            messages_sent: tx,
            bytes_received: self.stats.bytes_received.load(Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Relaxed),
            rate_limit_exceeded: self.stats.rate_limit_exceeded.load(Relaxed),
            receive_rate: rate(rx),
            send_rate: rate(tx),
        }
    }

    // ── Key/value data ──────────────────────────────────────────────────

    pub fn set_data(&self, key: &str, value: Value) {
        self.data.lock().expect("session data poisoned").insert(key.to_string(), value);
    }

    pub fn data(&self, key: &str) -> Option<Value> {
        self.data.lock().expect("session data poisoned").get(key).cloned()
    }

    pub fn set_property(&self, key: &str, value: &str) {
        self.properties
            .lock()
            .expect("session properties poisoned")
            .insert(key.to_string(), value.to_string());
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().expect("session properties poisoned").get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(queue: usize) -> (Session, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        (Session::new(1, addr, tx, TokenBucket::new(100.0, 1000)), rx)
    }

    #[test]
    fn bucket_permits_burst_then_refills_at_rate() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(100.0, 1000, t0);
        for _ in 0..1000 {
            assert!(bucket.try_take_at(t0));
        }
        assert!(!bucket.try_take_at(t0));
        // 10 ms at 100/s is exactly one token.
        assert!(bucket.try_take_at(t0 + Duration::from_millis(10)));
        assert!(!bucket.try_take_at(t0 + Duration::from_millis(10)));
        // A long pause never overfills.
        bucket.try_take_at(t0 + Duration::from_secs(3600));
        assert!(bucket.tokens() <= 1000.0 && bucket.tokens() >= 0.0);
    }

    #[test]
    fn exact_rate_passes_one_more_is_dropped() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(100.0, 100, t0);
        let passed = (0..101).filter(|_| bucket.try_take_at(t0)).count();
        assert_eq!(passed, 100);
    }

    #[test]
    fn overflowing_write_queue_closes_session() {
        let (s, _rx) = session(2);
        s.set_state(SessionState::Connected);
        assert!(s.send(&serde_json::json!({"type": "a"})));
        assert!(s.send(&serde_json::json!({"type": "b"})));
        assert!(!s.send(&serde_json::json!({"type": "c"})));
        assert_eq!(s.state(), SessionState::Closing);
        assert_eq!(s.close_reason().as_deref(), Some("write queue overflow"));
    }

    #[test]
    fn binary_frames_are_hex_lines() {
        let (s, mut rx) = session(4);
        assert!(s.send_binary(&[0xde, 0xad, 0x01]));
        assert_eq!(rx.try_recv().unwrap(), "BINARY:dead01\n");
    }

    #[test]
    fn fifty_violations_disconnect() {
        let (s, _rx) = session(4);
        for _ in 0..49 {
            s.record_violation();
        }
        assert_ne!(s.state(), SessionState::Closing);
        s.clear_violations();
        for _ in 0..MAX_VIOLATIONS {
            s.record_violation();
        }
        assert_eq!(s.state(), SessionState::Closing);
    }

    #[test]
    fn heartbeat_ping_sent_once_until_activity() {
        let (s, _rx) = session(4);
        assert!(s.mark_pinged());
        assert!(!s.mark_pinged());
        s.touch();
        assert!(s.mark_pinged());
        s.set_property("client", "web");
        assert_eq!(s.property("client").as_deref(), Some("web"));
    }
}
