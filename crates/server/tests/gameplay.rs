//! Game rules driven in-process, without sockets or the tick timer.

mod common;

use std::sync::Arc;

use common::test_config;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use worldcore_engine::world::position::Vec3;
use worldcore_server::entity::mobs;
use worldcore_server::entity::{Entity, EntityBody, EntityId, EntityKind, Player, Stats};
use worldcore_server::game::GameState;
use worldcore_server::net::session::Session;
use worldcore_server::protocol::Frame;
use worldcore_server::protocol::dispatcher::Dispatcher;
use worldcore_server::services::Services;

fn game(name: &str, with_zones: bool) -> GameState {
    let mut config = test_config(name);
    if with_zones {
        config.game.spawn_zones = mobs::default_zones();
    }
    let (services, _intents) = Services::build(config).unwrap();
    GameState::new(services)
}

fn player(session_id: u64, player_id: u64) -> Player {
    Player {
        session_id,
        player_id,
        username: format!("p{}", player_id),
        stats: Stats {
            health: 100.0,
            max_health: 100.0,
            attack: 10.0,
            defense: 5.0,
            speed: 5.0,
            level: 1,
            experience: 0,
        },
        gold: 0,
        inventory: Vec::new(),
        last_input_seq: 0,
    }
}

/// A logged-in session with a player entity at `pos`.
fn join(game: &mut GameState, player_id: u64, pos: Vec3) -> (Arc<Session>, mpsc::Receiver<String>, EntityId) {
    let (session, rx) = game.services.sessions.create("127.0.0.1:9".parse().unwrap()).unwrap();
    let entity = game.entities.create(pos, 0.5, EntityBody::Player(player(session.id(), player_id)));
    game.services.sessions.authenticate(session.id(), player_id, entity);
    (session, rx, entity)
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        out.push(serde_json::from_str(line.trim_end()).unwrap());
    }
    out
}

fn send(game: &mut GameState, session: &Session, kind: &str, body: Value) {
    Dispatcher::new().dispatch(game, session.id(), Frame::new(kind, body));
}

#[tokio::test]
async fn killing_a_zone_mob_drops_loot_and_schedules_respawn() {
    let mut game = game("s3", true);
    let spawned = game.mobs.tick(0.0, &mut game.entities, |_, _| None);
    let mob = spawned
        .iter()
        .copied()
        .find(|id| game.entities.get(*id).and_then(Entity::as_npc).is_some_and(|n| n.zone == Some(0)))
        .expect("goblin camp populated");
    let mob_pos = game.entities.get(mob).unwrap().position();
    let (_session, mut rx, me) = join(&mut game, 1, mob_pos + Vec3::new(1.0, 0.0, 0.0));

    let outcome = game.strike(me, mob, 10_000.0).unwrap();
    assert!(outcome.dead);
    assert!(!game.entities.contains(mob));

    let items = game.entities.ids_of_kind(EntityKind::Item);
    assert!(!items.is_empty());
    for id in &items {
        assert!(game.entities.get(*id).unwrap().position().distance_xz(mob_pos) < 2.0);
    }
    let stats = game.entities.get(me).and_then(Entity::stats).copied().unwrap();
    assert!(stats.experience > 0 || stats.level > 1);

    assert_eq!(game.mobs.pending().len(), 1);
    assert_eq!(game.mobs.pending()[0].zone, 0);

    let frames = drain(&mut rx);
    let combat = frames.iter().find(|f| f["type"] == "combat_event").unwrap();
    assert_eq!(combat["isDead"], true);
    assert_eq!(combat["target_id"], mob);
    assert!(frames.iter().any(|f| f["type"] == "loot_dropped"));
    assert!(frames.iter().any(|f| f["type"] == "experience_gained"));
}

#[tokio::test]
async fn attack_checks_range() {
    let mut game = game("attack", false);
    let (session, mut rx, _me) = join(&mut game, 1, Vec3::new(0.0, 20.0, 0.0));
    let (_other, _orx, far) = join(&mut game, 2, Vec3::new(10.0, 20.0, 0.0));

    send(&mut game, &session, "attack", json!({ "target_id": far }));
    let err = drain(&mut rx).into_iter().find(|f| f["type"] == "error").unwrap();
    assert_eq!(err["code"], 400);
    assert_eq!(err["message"], "Target out of range");

    send(&mut game, &session, "attack", json!({ "target_id": 999_999 }));
    let err = drain(&mut rx).into_iter().find(|f| f["type"] == "error").unwrap();
    assert_eq!(err["code"], 404);
}

#[tokio::test]
async fn spawn_rules_and_familiar_ownership() {
    let mut game = game("spawn", false);
    let here = Vec3::new(0.0, 20.0, 0.0);
    let (owner, mut rx, _) = join(&mut game, 1, here);
    let (stranger, mut srx, _) = join(&mut game, 2, here);

    send(&mut game, &owner, "entity_spawn_request", json!({ "kind": "npc", "npc_type": "goblin", "x": 1.0, "y": 20.0, "z": 0.0 }));
    let err = drain(&mut rx).into_iter().find(|f| f["type"] == "error").unwrap();
    assert_eq!(err["code"], 400);
    assert_eq!(err["message"], "forbidden spawn type");

    let mut familiars = Vec::new();
    for _ in 0..3 {
        send(&mut game, &owner, "entity_spawn_request", json!({ "kind": "familiar", "npc_type": "wolf", "x": 1.0, "y": 20.0, "z": 1.0 }));
        let ok = drain(&mut rx).into_iter().find(|f| f["type"] == "success").unwrap();
        assert_eq!(ok["message"], "entity_spawned");
        familiars.push(ok["data"]["entity_id"].as_u64().unwrap());
    }
    send(&mut game, &owner, "entity_spawn_request", json!({ "kind": "familiar", "npc_type": "cat", "x": 1.0, "y": 20.0, "z": 1.0 }));
    let err = drain(&mut rx).into_iter().find(|f| f["type"] == "error").unwrap();
    assert_eq!(err["message"], "Familiar limit reached");

    send(&mut game, &stranger, "familiar_command", json!({ "familiar_id": familiars[0], "command": "idle" }));
    let err = drain(&mut srx).into_iter().find(|f| f["type"] == "error").unwrap();
    assert_eq!(err["code"], 403);

    send(&mut game, &owner, "familiar_command", json!({ "familiar_id": familiars[0], "command": "patrol", "radius": 4.0 }));
    let ok = drain(&mut rx).into_iter().find(|f| f["type"] == "success").unwrap();
    assert_eq!(ok["message"], "command_accepted");
    let npc = game.entities.get(familiars[0]).and_then(Entity::as_npc).unwrap();
    assert_eq!(npc.patrol_radius, 4.0);
}

#[tokio::test]
async fn replication_sends_only_changes() {
    let mut game = game("replication", false);
    let here = Vec3::new(0.0, 20.0, 0.0);
    let (_viewer, mut rx, _) = join(&mut game, 1, here);
    let (_mover, _mrx, mover) = join(&mut game, 2, here + Vec3::new(3.0, 0.0, 0.0));

    game.replicate();
    let first = drain(&mut rx);
    let update = first.iter().find(|f| f["type"] == "entity_update").unwrap();
    assert_eq!(update["entities"].as_array().unwrap().len(), 2);

    game.replicate();
    assert!(drain(&mut rx).iter().all(|f| f["type"] != "entity_update"));

    game.entities.move_entity(mover, here + Vec3::new(4.0, 0.0, 0.0));
    game.replicate();
    let update = drain(&mut rx).into_iter().find(|f| f["type"] == "entity_update").unwrap();
    let entities = update["entities"].as_array().unwrap();
    assert_eq!(entities.len(), 1);

    game.entities.destroy(mover);
    game.replicate();
    let update = drain(&mut rx).into_iter().find(|f| f["type"] == "entity_update").unwrap();
    assert_eq!(update["removed"], json!([mover]));
}

#[tokio::test]
async fn friendly_npc_talks_hostile_does_not() {
    let mut game = game("talk", false);
    let here = Vec3::new(0.0, 20.0, 0.0);
    let (session, mut rx, me) = join(&mut game, 1, here);
    let merchant = game.entities.create(
        here + Vec3::new(2.0, 0.0, 0.0),
        0.5,
        EntityBody::Npc(worldcore_server::entity::npc::Npc::new("merchant".parse().unwrap(), 1, here)),
    );
    let goblin = game.entities.create(
        here + Vec3::new(0.0, 0.0, 2.0),
        0.5,
        EntityBody::Npc(worldcore_server::entity::npc::Npc::new("goblin".parse().unwrap(), 1, here)),
    );
    assert!(game.entities.contains(me));

    send(&mut game, &session, "npc_interaction", json!({ "npc_id": merchant }));
    let dialogue = drain(&mut rx).into_iter().find(|f| f["type"] == "npc_dialogue").unwrap();
    assert_eq!(dialogue["npc_type"], "merchant");
    assert!(dialogue["services"].as_array().is_some_and(|s| !s.is_empty()));

    send(&mut game, &session, "npc_interaction", json!({ "npc_id": goblin }));
    let err = drain(&mut rx).into_iter().find(|f| f["type"] == "error").unwrap();
    assert_eq!(err["code"], 400);
}
