//! Area-of-interest replication.
//!
//! Each session remembers the version of every entity it has been sent. After
//! a tick, entities inside the viewer's interest radius that are new or have a
//! newer version go out in one `entity_update`, along with the ids that left.
//! NPCs entering or leaving the set are also announced individually.

use std::collections::HashMap;

use rayon::prelude::*;
use serde_json::{Value, json};
use worldcore_engine::world::position::Vec3;

use crate::entity::{EntityId, EntityKind, EntityManager};
use crate::net::session::SessionId;

#[derive(Default)]
pub struct Replication {
    known: HashMap<SessionId, Known>,
}

/// Per-viewer record of what has been sent: entity id → (version, kind).
type Known = HashMap<EntityId, (u64, EntityKind)>;

impl Replication {
    pub fn forget_session(&mut self, session: SessionId) {
        self.known.remove(&session);
    }

    pub fn known_count(&self, session: SessionId) -> usize {
        self.known.get(&session).map_or(0, HashMap::len)
    }

    /// Build this tick's messages for every viewer `(session, entity, position)`.
    /// Viewers are processed in parallel; each owns its own version map.
    pub fn collect(
        &mut self,
        entities: &EntityManager,
        viewers: &[(SessionId, EntityId, Vec3)],
        radius: f32,
    ) -> Vec<(SessionId, Vec<Value>)> {
        let mut work: Vec<(SessionId, Vec3, Known)> = viewers
            .iter()
            .map(|&(sid, _, pos)| (sid, pos, self.known.remove(&sid).unwrap_or_default()))
            .collect();

        let out: Vec<(SessionId, Vec<Value>)> = work
            .par_iter_mut()
            .map(|(sid, pos, known)| (*sid, diff_for_viewer(entities, *pos, radius, known)))
            .filter(|(_, msgs)| !msgs.is_empty())
            .collect();

        for (sid, _, known) in work {
            self.known.insert(sid, known);
        }
        out
    }
}

fn diff_for_viewer(
    entities: &EntityManager,
    pos: Vec3,
    radius: f32,
    known: &mut Known,
) -> Vec<Value> {
    let visible = entities.in_radius(pos, radius, None);
    let mut messages = Vec::new();
    let mut changed = Vec::new();
    let mut current: Known = HashMap::with_capacity(visible.len());

    for id in visible {
        let Some(entity) = entities.get(id) else {
            continue;
        };
        let version = entity.header.version;
        current.insert(id, (version, entity.kind()));
        match known.get(&id) {
            Some(&(v, _)) if v == version => {}
            Some(_) => changed.push(entity.snapshot()),
            None => {
                let snapshot = entity.snapshot();
                if entity.kind() == EntityKind::Npc {
                    messages.push(json!({ "type": "npc_spawn", "npc": snapshot.clone() }));
                }
                changed.push(snapshot);
            }
        }
    }

    let mut removed: Vec<EntityId> = known.keys().filter(|id| !current.contains_key(id)).copied().collect();
    removed.sort_unstable();
    for &id in &removed {
        if known.get(&id).is_some_and(|&(_, kind)| kind == EntityKind::Npc) {
            let reason = if entities.contains(id) { "out_of_range" } else { "removed" };
            messages.push(json!({ "type": "npc_despawn", "npc_id": id, "reason": reason }));
        }
    }

    if !changed.is_empty() || !removed.is_empty() {
        messages.push(json!({ "type": "entity_update", "entities": changed, "removed": removed }));
    }
    *known = current;
    messages
}
