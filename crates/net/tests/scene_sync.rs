//! Generic rooms: diffs flow through the relay into every member's scene.

mod common;

use common::*;
use mixer_core::{ChangeKind, DataProxy, MemoryScene};
use mixer_net::{Client, ClientEvent, GenericReplicator, Opcode, RoomProtocol};
use pretty_assertions::assert_eq;

type Replicator = GenericReplicator<MemoryScene>;

async fn join_generic(
    server: &mixer_net::Broadcaster,
    name: &str,
) -> (Client, Replicator) {
    let (client, event) = joined(server, "shot-010", RoomProtocol::Generic, name).await;
    let mut replicator = Replicator::new(MemoryScene::new());
    replicator.handle_event(&event).unwrap();
    (client, replicator)
}

/// Flush local edits and wait until the room committed them
async fn publish(client: &mut Client, replicator: &mut Replicator) {
    replicator.flush(client).await.unwrap().expect("local changes");
    let ack = wait_for(client, |e| {
        matches!(
            e,
            ClientEvent::Acknowledged {
                opcode: Opcode::SceneDiff,
                ..
            }
        )
    })
    .await;
    replicator.handle_event(&ack).unwrap();
}

/// Feed events to the replicator until `count` remote diffs were applied
async fn receive(client: &mut Client, replicator: &mut Replicator, count: usize) {
    let mut applied = 0;
    while applied < count {
        let event = next(client).await;
        if let Some(report) = replicator.handle_event(&event).unwrap() {
            assert!(report.skipped.is_empty(), "skipped entries: {:?}", report.skipped);
            applied += 1;
        }
    }
}

#[tokio::test]
async fn late_joiner_rebuilds_scene_from_snapshot() {
    let server = start(local_config()).await;
    let (mut x, mut x_rep) = join_generic(&server, "x").await;

    x_rep.scene_mut().upsert(
        DataProxy::new("cube-1", "object")
            .with_attribute("color", "red")
            .with_attribute("size", 2),
    );
    publish(&mut x, &mut x_rep).await;

    let (_y, y_rep) = join_generic(&server, "y").await;

    assert_eq!(y_rep.scene().get("cube-1"), x_rep.scene().get("cube-1"));
    assert_eq!(y_rep.engine().tree(), x_rep.engine().tree());
    assert_eq!(
        y_rep.scene().history(),
        &[(ChangeKind::Created, "cube-1".to_string())]
    );
}

#[tokio::test]
async fn last_update_wins() {
    let server = start(local_config()).await;
    let (mut x, mut x_rep) = join_generic(&server, "x").await;
    let (mut y, mut y_rep) = join_generic(&server, "y").await;

    x_rep
        .scene_mut()
        .upsert(DataProxy::new("cube-1", "object").with_attribute("color", "grey"));
    publish(&mut x, &mut x_rep).await;

    for color in ["red", "blue"] {
        x_rep
            .scene_mut()
            .edit("cube-1", |p| p.set_attribute("color", color));
        publish(&mut x, &mut x_rep).await;
    }

    receive(&mut y, &mut y_rep, 3).await;

    let cube = y_rep.scene().get("cube-1").unwrap();
    assert_eq!(cube.attribute("color").unwrap(), "blue");
    assert_eq!(y_rep.engine().tree(), x_rep.engine().tree());
}

#[tokio::test]
async fn dependent_deleted_before_its_mesh() {
    let server = start(local_config()).await;
    let (mut x, mut x_rep) = join_generic(&server, "x").await;
    let (mut y, mut y_rep) = join_generic(&server, "y").await;

    x_rep.scene_mut().upsert(DataProxy::new("mesh-data-1", "mesh"));
    x_rep
        .scene_mut()
        .upsert(DataProxy::new("cube-1", "object").depends_on("mesh-data-1"));
    publish(&mut x, &mut x_rep).await;

    x_rep.scene_mut().remove("mesh-data-1");
    x_rep.scene_mut().remove("cube-1");
    publish(&mut x, &mut x_rep).await;

    receive(&mut y, &mut y_rep, 2).await;

    assert!(y_rep.scene().is_empty());
    let deletions: Vec<&str> = y_rep
        .scene()
        .history()
        .iter()
        .filter(|(kind, _)| *kind == ChangeKind::Deleted)
        .map(|(_, id)| id.as_str())
        .collect();
    assert_eq!(deletions, vec!["cube-1", "mesh-data-1"]);
}

#[tokio::test]
async fn snapshot_hides_deleted_proxies_from_replay() {
    let server = start(local_config()).await;
    let (mut x, mut x_rep) = join_generic(&server, "x").await;

    x_rep.scene_mut().upsert(DataProxy::new("cube-1", "object"));
    publish(&mut x, &mut x_rep).await;
    x_rep.scene_mut().remove("cube-1");
    publish(&mut x, &mut x_rep).await;

    // The replay buffer still holds the creation, the snapshot its tombstone
    let (_y, y_rep) = join_generic(&server, "y").await;
    assert!(y_rep.scene().is_empty());
    assert!(y_rep.scene().history().is_empty());
}

#[tokio::test]
async fn resync_reloads_room_state() {
    let server = start(local_config()).await;
    let (mut x, mut x_rep) = join_generic(&server, "x").await;
    let (mut y, mut y_rep) = join_generic(&server, "y").await;

    x_rep
        .scene_mut()
        .upsert(DataProxy::new("light-1", "light").with_attribute("energy", 10));
    publish(&mut x, &mut x_rep).await;

    y.request_state().await.unwrap();
    let event = wait_for(&mut y, |e| matches!(e, ClientEvent::RoomJoined(_))).await;
    match &event {
        ClientEvent::RoomJoined(state) => assert_eq!(state.last_sequence, 1),
        _ => unreachable!(),
    }
    y_rep.handle_event(&event).unwrap();

    assert_eq!(y_rep.engine().tree(), x_rep.engine().tree());
    assert_eq!(y.last_sequence().await, 1);
}
