//! Registry of live sessions and their broadcast groups.
//!
//! Lock order is `sessions → groups`, never the reverse. Per-session stats are
//! atomics and need no lock.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use worldcore_engine::world::position::Vec3;

use super::session::{Session, SessionId, SessionState, TokenBucket};
use crate::dashboard::Metrics;
use crate::entity::{EntityId, EntityKind, EntityManager};
use crate::error::ProtocolError;
use crate::persistence::PlayerId;
use crate::protocol::now_millis;

pub const GROUP_ALL: &str = "all";
pub const GROUP_CONNECTED: &str = "connected";
pub const GROUP_UNAUTHENTICATED: &str = "unauthenticated";
pub const GROUP_AUTHENTICATED: &str = "authenticated";
pub const BUILTIN_GROUPS: [&str; 4] = [GROUP_ALL, GROUP_CONNECTED, GROUP_UNAUTHENTICATED, GROUP_AUTHENTICATED];

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_connections: usize,
    pub write_queue_capacity: usize,
    pub rate_per_second: f64,
    pub burst: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self { max_connections: 10_000, write_queue_capacity: 4096, rate_per_second: 100.0, burst: 1000 }
    }
}

/// Outcome of one heartbeat pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatSweep {
    pub pinged: Vec<SessionId>,
    pub timed_out: Vec<SessionId>,
}

pub struct SessionManager {
    limits: SessionLimits,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    groups: RwLock<HashMap<String, BTreeSet<SessionId>>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(limits: SessionLimits, metrics: Arc<Metrics>) -> Self {
        let groups = BUILTIN_GROUPS.iter().map(|g| (g.to_string(), BTreeSet::new())).collect();
        Self {
            limits,
            sessions: RwLock::new(HashMap::new()),
            groups: RwLock::new(groups),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Register a freshly accepted socket. Fails with 403 when the server is
    /// at `max_connections`.
    pub fn create(&self, remote: SocketAddr) -> Result<(Arc<Session>, mpsc::Receiver<String>), ProtocolError> {
        let mut sessions = self.sessions.write().expect("sessions poisoned");
        if sessions.len() >= self.limits.max_connections {
            return Err(ProtocolError::forbidden("server full"));
        }
        let id = self.next_id.fetch_add(1, Relaxed);
        let (tx, rx) = mpsc::channel(self.limits.write_queue_capacity.max(1));
        let bucket = TokenBucket::new(self.limits.rate_per_second, self.limits.burst);
        let session = Arc::new(Session::new(id, remote, tx, bucket));
        session.set_state(SessionState::Connected);
        sessions.insert(id, Arc::clone(&session));

        let mut groups = self.groups.write().expect("groups poisoned");
        let mut joined = session.groups_mut();
        for g in [GROUP_ALL, GROUP_CONNECTED, GROUP_UNAUTHENTICATED] {
            groups.entry(g.to_string()).or_default().insert(id);
            joined.insert(g.to_string());
        }
        drop(joined);
        self.metrics.session_opened();
        tracing::debug!("Session {} opened from {}", id, remote);
        Ok((session, rx))
    }

    /// Drop a session and its group memberships. Returns it if it was live.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().expect("sessions poisoned");
        let session = sessions.remove(&id)?;
        let mut groups = self.groups.write().expect("groups poisoned");
        for name in session.groups_mut().drain() {
            if let Some(members) = groups.get_mut(&name) {
                members.remove(&id);
                if members.is_empty() && !BUILTIN_GROUPS.contains(&name.as_str()) {
                    groups.remove(&name);
                }
            }
        }
        session.set_state(SessionState::Closed);
        self.metrics.session_closed();
        tracing::debug!("Session {} removed", id);
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().expect("sessions poisoned").get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().expect("sessions poisoned").len()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().expect("sessions poisoned").values().cloned().collect()
    }

    /// Move a session from `unauthenticated` to `authenticated`. Fails for
    /// unknown sessions and for sessions already closing.
    pub fn authenticate(&self, id: SessionId, player_id: PlayerId, entity_id: EntityId) -> bool {
        let sessions = self.sessions.read().expect("sessions poisoned");
        let Some(session) = sessions.get(&id) else {
            return false;
        };
        if !session.advance_state(SessionState::Authenticated) {
            return false;
        }
        session.set_player(Some((player_id, entity_id)));
        let mut groups = self.groups.write().expect("groups poisoned");
        let mut joined = session.groups_mut();
        if let Some(g) = groups.get_mut(GROUP_UNAUTHENTICATED) {
            g.remove(&id);
        }
        joined.remove(GROUP_UNAUTHENTICATED);
        groups.entry(GROUP_AUTHENTICATED.to_string()).or_default().insert(id);
        joined.insert(GROUP_AUTHENTICATED.to_string());
        true
    }

    /// Reverse of [`authenticate`](Self::authenticate), used by `logout`.
    pub fn deauthenticate(&self, id: SessionId) -> bool {
        let sessions = self.sessions.read().expect("sessions poisoned");
        let Some(session) = sessions.get(&id) else {
            return false;
        };
        session.set_player(None);
        if session.state() == SessionState::Authenticated {
            session.set_state(SessionState::Connected);
        }
        let mut groups = self.groups.write().expect("groups poisoned");
        let mut joined = session.groups_mut();
        if let Some(g) = groups.get_mut(GROUP_AUTHENTICATED) {
            g.remove(&id);
        }
        joined.remove(GROUP_AUTHENTICATED);
        groups.entry(GROUP_UNAUTHENTICATED.to_string()).or_default().insert(id);
        joined.insert(GROUP_UNAUTHENTICATED.to_string());
        true
    }

    // ── Groups ──────────────────────────────────────────────────────────

    /// Join a custom group. Built-in group names are reserved.
    pub fn join_group(&self, id: SessionId, group: &str) -> Result<(), ProtocolError> {
        validate_group_name(group)?;
        let sessions = self.sessions.read().expect("sessions poisoned");
        let session = sessions.get(&id).ok_or_else(|| ProtocolError::not_found("Session not found"))?;
        let mut groups = self.groups.write().expect("groups poisoned");
        groups.entry(group.to_string()).or_default().insert(id);
        session.groups_mut().insert(group.to_string());
        Ok(())
    }

    pub fn leave_group(&self, id: SessionId, group: &str) -> Result<(), ProtocolError> {
        validate_group_name(group)?;
        let sessions = self.sessions.read().expect("sessions poisoned");
        let session = sessions.get(&id).ok_or_else(|| ProtocolError::not_found("Session not found"))?;
        let mut groups = self.groups.write().expect("groups poisoned");
        let removed = match groups.get_mut(group) {
            Some(members) => {
                let removed = members.remove(&id);
                if members.is_empty() {
                    groups.remove(group);
                }
                removed
            }
            None => false,
        };
        if !removed {
            return Err(ProtocolError::not_found(format!("Not a member of group '{}'", group)));
        }
        session.groups_mut().remove(group);
        Ok(())
    }

    pub fn group_members(&self, group: &str) -> Vec<SessionId> {
        self.groups
            .read()
            .expect("groups poisoned")
            .get(group)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    pub fn send_to(&self, id: SessionId, msg: &Value) -> bool {
        match self.get(id) {
            Some(s) => s.send(msg),
            None => false,
        }
    }

    /// Send to every current member of `group`. Returns the number queued.
    pub fn broadcast_to_group(&self, group: &str, msg: &Value) -> usize {
        let members = self.group_members(group);
        self.send_many(members, msg)
    }

    /// Send to every session matching `pred`.
    pub fn broadcast_filter(&self, pred: impl Fn(&Session) -> bool, msg: &Value) -> usize {
        let targets: Vec<Arc<Session>> = self
            .sessions
            .read()
            .expect("sessions poisoned")
            .values()
            .filter(|s| pred(s))
            .cloned()
            .collect();
        let line = to_line(msg);
        targets.iter().filter(|s| s.send_line(line.clone())).count()
    }

    /// Send to the sessions of players within `radius` of `pos`.
    pub fn broadcast_to_nearby(
        &self,
        entities: &EntityManager,
        pos: Vec3,
        radius: f32,
        msg: &Value,
        exclude: Option<SessionId>,
    ) -> usize {
        let targets: Vec<SessionId> = entities
            .in_radius(pos, radius, Some(EntityKind::Player))
            .into_iter()
            .filter_map(|id| entities.get(id)?.as_player().map(|p| p.session_id))
            .filter(|sid| Some(*sid) != exclude)
            .collect();
        self.send_many(targets, msg)
    }

    fn send_many(&self, ids: Vec<SessionId>, msg: &Value) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let line = to_line(msg);
        let sessions = self.sessions.read().expect("sessions poisoned");
        ids.iter()
            .filter_map(|id| sessions.get(id))
            .filter(|s| s.send_line(line.clone()))
            .count()
    }

    // ── Heartbeat ───────────────────────────────────────────────────────

    /// Ping sessions idle for `heartbeat` and close those idle for twice that.
    pub fn sweep_heartbeats(&self, now: Instant, heartbeat: Duration) -> HeartbeatSweep {
        let mut sweep = HeartbeatSweep::default();
        for session in self.all() {
            let idle = session.idle_for(now);
            if idle >= heartbeat * 2 {
                tracing::info!("Session {} timed out after {:?} idle", session.id(), idle);
                session.close("heartbeat timeout");
                sweep.timed_out.push(session.id());
            } else if idle >= heartbeat && session.mark_pinged() {
                session.send(&json!({ "type": "ping", "server_time": now_millis() }));
                sweep.pinged.push(session.id());
            }
        }
        sweep
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Relaxed)
    }

    /// Announce shutdown to every session. Returns how many were notified.
    pub fn begin_graceful_shutdown(&self, grace: Duration) -> usize {
        if self.shutting_down.swap(true, Relaxed) {
            return 0;
        }
        let notice = json!({
            "type": "shutdown_notice",
            "timeout_seconds": grace.as_secs(),
            "message": format!("Server shutting down in {} seconds", grace.as_secs()),
            "timestamp": now_millis(),
        });
        let n = self.broadcast_to_group(GROUP_ALL, &notice);
        tracing::info!("Shutdown notice sent to {} sessions", n);
        n
    }

    /// Close every remaining session.
    pub fn force_close_all(&self, reason: &str) -> usize {
        let sessions = self.all();
        for s in &sessions {
            s.close(reason);
        }
        sessions.len()
    }
}

fn to_line(msg: &Value) -> String {
    let mut line = msg.to_string();
    line.push('\n');
    line
}

fn validate_group_name(group: &str) -> Result<(), ProtocolError> {
    if group.is_empty() || group.len() > 64 {
        return Err(ProtocolError::bad_request("Group name must be 1-64 characters"));
    }
    if BUILTIN_GROUPS.contains(&group) {
        return Err(ProtocolError::forbidden(format!("Group '{}' is reserved", group)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityBody, Player, Stats};
    use worldcore_engine::collision::CollisionSystem;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn manager(limits: SessionLimits) -> SessionManager {
        SessionManager::new(limits, Arc::new(Metrics::new()))
    }

    #[test]
    fn new_sessions_join_default_groups_and_move_on_login() {
        let mgr = manager(SessionLimits::default());
        let (s, _rx) = mgr.create(addr()).unwrap();
        assert_eq!(s.groups(), vec!["all", "connected", "unauthenticated"]);
        assert!(mgr.authenticate(s.id(), 7, 70));
        assert_eq!(s.groups(), vec!["all", "authenticated", "connected"]);
        assert_eq!(mgr.group_members(GROUP_AUTHENTICATED), vec![s.id()]);
        assert!(mgr.group_members(GROUP_UNAUTHENTICATED).is_empty());
        assert_eq!(s.player(), Some((7, 70)));

        mgr.remove(s.id());
        assert!(mgr.group_members(GROUP_ALL).is_empty());
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn closing_session_cannot_authenticate() {
        let mgr = manager(SessionLimits::default());
        let (s, _rx) = mgr.create(addr()).unwrap();
        s.close("client went away");
        assert!(!mgr.authenticate(s.id(), 7, 70));
        assert_eq!(s.state(), SessionState::Closing);
        assert_eq!(s.player(), None);
        assert!(mgr.group_members(GROUP_AUTHENTICATED).is_empty());
        assert_eq!(mgr.group_members(GROUP_UNAUTHENTICATED), vec![s.id()]);
    }

    #[test]
    fn connection_limit_rejects_with_403() {
        let mgr = manager(SessionLimits { max_connections: 1, ..SessionLimits::default() });
        let _first = mgr.create(addr()).unwrap();
        let err = mgr.create(addr()).unwrap_err();
        assert_eq!((err.code, err.message.as_str()), (403, "server full"));
    }

    #[test]
    fn custom_groups_broadcast_and_reserved_names_fail() {
        let mgr = manager(SessionLimits::default());
        let (a, mut rx_a) = mgr.create(addr()).unwrap();
        let (_b, mut rx_b) = mgr.create(addr()).unwrap();
        mgr.join_group(a.id(), "party").unwrap();
        assert_eq!(mgr.join_group(a.id(), "authenticated").unwrap_err().code, 403);

        assert_eq!(mgr.broadcast_to_group("party", &json!({"type": "hi"})), 1);
        assert!(rx_a.try_recv().unwrap().contains("\"hi\""));
        assert!(rx_b.try_recv().is_err());

        mgr.leave_group(a.id(), "party").unwrap();
        assert_eq!(mgr.leave_group(a.id(), "party").unwrap_err().code, 404);
    }

    #[test]
    fn broadcast_filter_uses_predicate() {
        let mgr = manager(SessionLimits::default());
        let (a, _rx_a) = mgr.create(addr()).unwrap();
        let (_b, _rx_b) = mgr.create(addr()).unwrap();
        mgr.authenticate(a.id(), 1, 1);
        assert_eq!(mgr.broadcast_filter(|s| s.is_authenticated(), &json!({"type": "x"})), 1);
    }

    #[test]
    fn nearby_broadcast_reaches_players_in_radius() {
        let mgr = manager(SessionLimits::default());
        let (near, mut rx_near) = mgr.create(addr()).unwrap();
        let (far, mut rx_far) = mgr.create(addr()).unwrap();
        let mut entities = EntityManager::new(Arc::new(CollisionSystem::new()));
        let stats = Stats {
            health: 100.0,
            max_health: 100.0,
            attack: 10.0,
            defense: 5.0,
            speed: 5.0,
            level: 1,
            experience: 0,
        };
        for (session, pos) in [(&near, Vec3::new(1.0, 0.0, 1.0)), (&far, Vec3::new(500.0, 0.0, 0.0))] {
            entities.create(
                pos,
                0.5,
                EntityBody::Player(Player {
                    session_id: session.id(),
                    player_id: session.id(),
                    username: format!("p{}", session.id()),
                    stats,
                    gold: 0,
                    inventory: Vec::new(),
                    last_input_seq: 0,
                }),
            );
        }
        let n = mgr.broadcast_to_nearby(&entities, Vec3::ZERO, 10.0, &json!({"type": "boom"}), None);
        assert_eq!(n, 1);
        assert!(rx_near.try_recv().is_ok());
        assert!(rx_far.try_recv().is_err());
    }

    #[test]
    fn heartbeat_pings_then_times_out() {
        let mgr = manager(SessionLimits::default());
        let (s, mut rx) = mgr.create(addr()).unwrap();
        let h = Duration::from_secs(30);
        let now = Instant::now();

        assert_eq!(mgr.sweep_heartbeats(now, h), HeartbeatSweep::default());
        let sweep = mgr.sweep_heartbeats(now + h, h);
        assert_eq!(sweep.pinged, vec![s.id()]);
        assert!(rx.try_recv().unwrap().contains("\"ping\""));
        // Only one ping per idle stretch.
        assert!(mgr.sweep_heartbeats(now + h + Duration::from_secs(1), h).pinged.is_empty());

        let sweep = mgr.sweep_heartbeats(now + h * 2, h);
        assert_eq!(sweep.timed_out, vec![s.id()]);
        assert_eq!(s.state(), SessionState::Closing);
    }

    #[test]
    fn graceful_shutdown_notifies_once() {
        let mgr = manager(SessionLimits::default());
        let (_s, mut rx) = mgr.create(addr()).unwrap();
        assert_eq!(mgr.begin_graceful_shutdown(Duration::from_secs(30)), 1);
        assert_eq!(mgr.begin_graceful_shutdown(Duration::from_secs(30)), 0);
        let notice: Value = serde_json::from_str(rx.try_recv().unwrap().trim_end()).unwrap();
        assert_eq!(notice["type"], "shutdown_notice");
        assert_eq!(notice["timeout_seconds"], 30);
        assert!(mgr.is_shutting_down());
        assert_eq!(mgr.force_close_all("shutdown"), 1);
    }
}
