//! Every member of a room observes committed commands in one total order.

mod common;

use std::collections::BTreeMap;

use common::*;
use mixer_net::{ClientEvent, Opcode, RoomProtocol};

const PER_CLIENT: usize = 20;

#[tokio::test]
async fn all_members_see_identical_order() {
    let server = start(local_config()).await;

    let mut clients = Vec::new();
    for name in ["ana", "ben", "cho"] {
        let (client, _) = joined(&server, "shot-010", RoomProtocol::Vrtist, name).await;
        clients.push(client);
    }
    let total = (PER_CLIENT * clients.len()) as u64;

    let mut tasks = Vec::new();
    for (index, mut client) in clients.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            for i in 0..PER_CLIENT {
                client
                    .send_blob(vec![index as u8, i as u8])
                    .await
                    .expect("send blob");
            }

            // sequence -> payload, None for our own commands
            let mut seen: BTreeMap<u64, Option<Vec<u8>>> = BTreeMap::new();
            let mut order = Vec::new();
            while (seen.len() as u64) < total {
                match next(&mut client).await {
                    ClientEvent::Committed(cmd) => {
                        let seq = cmd.sequence.expect("committed command has a sequence");
                        assert_eq!(cmd.opcode, Opcode::BlobUpdate);
                        order.push(seq);
                        assert!(seen.insert(seq, Some(cmd.payload)).is_none());
                    }
                    ClientEvent::Acknowledged { sequence, .. } => {
                        order.push(sequence);
                        assert!(seen.insert(sequence, None).is_none());
                    }
                    _ => {}
                }
            }
            (order, seen)
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.expect("client task"));
    }

    let expected: Vec<u64> = (1..=total).collect();
    for (order, _) in &results {
        assert_eq!(order, &expected, "sequence numbers arrive once, in order");
    }

    // Whoever saw a payload for a sequence number saw the same one
    for seq in 1..=total {
        let payloads: Vec<&Vec<u8>> = results
            .iter()
            .filter_map(|(_, seen)| seen.get(&seq).and_then(Option::as_ref))
            .collect();
        assert_eq!(payloads.len(), 2, "two peers receive each command");
        assert_eq!(payloads[0], payloads[1]);
    }
}

#[tokio::test]
async fn sender_commands_keep_their_order() {
    let server = start(local_config()).await;
    let (sender, _) = joined(&server, "shot", RoomProtocol::Vrtist, "ana").await;
    let (mut receiver, _) = joined(&server, "shot", RoomProtocol::Vrtist, "ben").await;

    for i in 0..10u8 {
        sender.send_blob(vec![i]).await.unwrap();
    }

    let mut payloads = Vec::new();
    while payloads.len() < 10 {
        if let ClientEvent::Committed(cmd) = next(&mut receiver).await {
            payloads.push(cmd.payload[0]);
        }
    }
    assert_eq!(payloads, (0..10u8).collect::<Vec<_>>());
}

#[tokio::test]
async fn rooms_are_independent() {
    let server = start(local_config()).await;
    let (a, _) = joined(&server, "left", RoomProtocol::Vrtist, "ana").await;
    let (mut b, _) = joined(&server, "right", RoomProtocol::Vrtist, "ben").await;
    let (mut c, _) = joined(&server, "left", RoomProtocol::Vrtist, "cho").await;

    a.send_blob(vec![1]).await.unwrap();

    let event = wait_for(&mut c, |e| matches!(e, ClientEvent::Committed(_))).await;
    match event {
        ClientEvent::Committed(cmd) => assert_eq!(cmd.sequence, Some(1)),
        _ => unreachable!(),
    }

    b.send_blob(vec![2]).await.unwrap();
    match wait_for(&mut b, |e| matches!(e, ClientEvent::Acknowledged { .. })).await {
        ClientEvent::Acknowledged { sequence, .. } => assert_eq!(sequence, 1),
        _ => unreachable!(),
    }
}
