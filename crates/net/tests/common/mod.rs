#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use mixer_net::{Broadcaster, BroadcasterConfig, Client, ClientConfig, ClientEvent, RoomProtocol};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn local_config() -> BroadcasterConfig {
    BroadcasterConfig {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..BroadcasterConfig::default()
    }
}

pub async fn start(config: BroadcasterConfig) -> Broadcaster {
    init_tracing();
    Broadcaster::listen(config).await.expect("start broadcaster")
}

pub async fn connect(server: &Broadcaster) -> Client {
    Client::connect(server.addr()).await.expect("connect client")
}

pub async fn connect_with(server: &Broadcaster, config: ClientConfig) -> Client {
    Client::connect_with(server.addr(), config)
        .await
        .expect("connect client")
}

/// Connect and join, returning the client after ROOM_STATE arrived
pub async fn joined(
    server: &Broadcaster,
    room: &str,
    protocol: RoomProtocol,
    name: &str,
) -> (Client, ClientEvent) {
    let mut client = connect(server).await;
    client
        .join_room(room, protocol, name)
        .await
        .expect("send join");
    let event = wait_for(&mut client, |e| matches!(e, ClientEvent::RoomJoined(_))).await;
    (client, event)
}

/// Next event, failing the test after [`WAIT`]
pub async fn next(client: &mut Client) -> ClientEvent {
    tokio::time::timeout(WAIT, client.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches
pub async fn wait_for(client: &mut Client, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
    loop {
        let event = next(client).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Collect every event arriving within `window`
pub async fn drain_for(client: &mut Client, window: Duration) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, client.next_event()).await {
        events.push(event);
    }
    events
}
