//! End-to-end tests: real WebSocket clients against a running server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use keyrace::prelude::*;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio_tungstenite::tungstenite::Message;

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

// =========================================================================
// Helpers
// =========================================================================

fn test_config() -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".into(),
        countdown: Duration::from_millis(100),
        grace_period: Some(Duration::from_millis(300)),
        default_race: RaceConfig::Words { word_count: 2 },
        ..ServerConfig::default()
    }
}

/// Every word is "go", so a two-word race reads "go go".
fn words() -> StaticWordSource {
    StaticWordSource::new(vec!["go".into()])
}

async fn launch<A, D, W, S>(server: KeyraceServer<A, D, W, S>) -> (String, ServerHandle<A, D, W, S>)
where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    let addr = server.local_addr().unwrap().to_string();
    let handle = server.handle();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    (addr, handle)
}

async fn start(
    config: ServerConfig,
) -> (
    String,
    ServerHandle<GuestOnly, InMemoryRoomDirectory, StaticWordSource, NoopResultStore>,
) {
    let server = KeyraceServer::builder()
        .config(config)
        .words(words())
        .build()
        .await
        .unwrap();
    launch(server).await
}

async fn ws(addr: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, kind: &str, payload: Value) {
    let frame = json!({ "type": kind, "payload": payload });
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next server event, skipping control frames.
async fn recv(ws: &mut Ws) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Skips events until one matches.
async fn recv_until(ws: &mut Ws, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = recv(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn create_room(ws: &mut Ws, config: Option<RaceConfig>) -> RoomId {
    send(ws, "CREATE_ROOM", json!({ "config": config })).await;
    match recv(ws).await {
        ServerEvent::RoomCreated { room_id } => room_id,
        other => panic!("expected ROOM_CREATED, got {other:?}"),
    }
}

async fn join_with(ws: &mut Ws, room: &str, name: &str, token: Option<&str>) -> (SessionId, RoomSnapshot) {
    send(
        ws,
        "JOIN_ROOM",
        json!({ "roomId": room, "username": name, "token": token }),
    )
    .await;
    match recv(ws).await {
        ServerEvent::RoomState { session_id, room } => (session_id, room),
        other => panic!("expected ROOM_STATE, got {other:?}"),
    }
}

async fn join(ws: &mut Ws, room: &RoomId, name: &str) -> SessionId {
    join_with(ws, room.as_str(), name, None).await.0
}

/// Host `a` and guest `b` in a fresh room, with b's arrival drained from a.
async fn two_player_room(addr: &str) -> (Ws, Ws, RoomId, SessionId, SessionId) {
    let mut a = ws(addr).await;
    let mut b = ws(addr).await;
    let room = create_room(&mut a, None).await;
    let a_id = join(&mut a, &room, "ana").await;
    let b_id = join(&mut b, &room, "bob").await;
    match recv(&mut a).await {
        ServerEvent::PlayerJoined { participant } => assert_eq!(participant.session_id, b_id),
        other => panic!("expected PLAYER_JOINED, got {other:?}"),
    }
    (a, b, room, a_id, b_id)
}

/// Starts the race from the host and waits until both clients see it.
async fn race_started(a: &mut Ws, b: &mut Ws) {
    send(a, "START_RACE", json!({})).await;
    for ws in [&mut *a, &mut *b] {
        assert!(matches!(recv(ws).await, ServerEvent::CountdownStart { .. }));
        assert_eq!(recv(ws).await, ServerEvent::RaceStart {});
    }
}

fn replay(text: &str) -> Vec<ReplayEvent> {
    text.chars()
        .enumerate()
        .map(|(i, c)| ReplayEvent::key(c.to_string(), i as i64 * 100))
        .collect()
}

fn submission(wpm: f64, accuracy: f64, text: &str) -> SubmitResult {
    SubmitResult {
        wpm,
        raw: wpm,
        accuracy,
        consistency: 90.0,
        replay_data: replay(text),
        start_time: 1_000,
        end_time: 2_000,
        afk_duration: 0.0,
        hash: String::new(),
    }
}

// =========================================================================
// Joining
// =========================================================================

#[tokio::test]
async fn test_create_and_join_room() {
    let (addr, _) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let mut b = ws(&addr).await;

    let room = create_room(&mut a, None).await;
    assert_eq!(room.as_str().len(), 6);

    let (a_id, snapshot) = join_with(&mut a, room.as_str(), "ana", None).await;
    assert_eq!(snapshot.status, RoomStatus::Lobby);
    assert_eq!(snapshot.text, ["go", "go"]);
    assert_eq!(snapshot.participants.len(), 1);
    assert!(snapshot.participants[0].is_host);
    assert_eq!(snapshot.participants[0].session_id, a_id);

    let (b_id, snapshot) = join_with(&mut b, room.as_str(), "bob", None).await;
    assert_eq!(snapshot.participants.len(), 2);
    assert!(!snapshot.participants[1].is_host);

    match recv(&mut a).await {
        ServerEvent::PlayerJoined { participant } => {
            assert_eq!(participant.session_id, b_id);
            assert_eq!(participant.username, "bob");
        }
        other => panic!("expected PLAYER_JOINED, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_normalizes_room_code() {
    let (addr, _) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, None).await;

    let typed = format!("  {} ", room.as_str().to_ascii_lowercase());
    let (_, snapshot) = join_with(&mut a, &typed, "ana", None).await;
    assert_eq!(snapshot.id, room);
}

#[tokio::test]
async fn test_join_unknown_room_errors() {
    let (addr, _) = start(test_config()).await;
    let mut a = ws(&addr).await;
    send(&mut a, "JOIN_ROOM", json!({ "roomId": "ZZZZZZ", "username": "ana" })).await;
    assert_eq!(recv(&mut a).await, ServerEvent::error("Room ZZZZZZ not found"));
}

#[tokio::test]
async fn test_rejoin_same_room_resends_state() {
    let (addr, handle) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, None).await;
    let first = join(&mut a, &room, "ana").await;

    let (second, snapshot) = join_with(&mut a, room.as_str(), "ana", None).await;
    assert_eq!(first, second);
    assert_eq!(snapshot.participants.len(), 1);
    assert_eq!(handle.room_snapshot(&room).await.unwrap().participants.len(), 1);
}

#[tokio::test]
async fn test_unknown_and_malformed_events_are_ignored() {
    let (addr, _) = start(test_config()).await;
    let mut a = ws(&addr).await;

    send(&mut a, "DANCE", json!({})).await;
    send(&mut a, "JOIN_ROOM", json!({ "nope": 1 })).await;
    a.send(Message::text("not json")).await.unwrap();

    // Nothing came back for the three frames above.
    let room = create_room(&mut a, None).await;
    assert_eq!(room.as_str().len(), 6);
}

// =========================================================================
// Race flow
// =========================================================================

#[tokio::test]
async fn test_non_host_cannot_start_race() {
    let (addr, _) = start(test_config()).await;
    let (_a, mut b, ..) = two_player_room(&addr).await;

    send(&mut b, "START_RACE", json!({})).await;
    assert_eq!(recv(&mut b).await, ServerEvent::error("Only the host can start the race"));
}

#[tokio::test]
async fn test_first_finisher_ends_race_with_rank_one() {
    let (addr, _) = start(test_config()).await;
    let (mut a, mut b, _, a_id, b_id) = two_player_room(&addr).await;
    race_started(&mut a, &mut b).await;

    send(&mut b, "UPDATE_PROGRESS", json!({ "typedLength": 2 })).await;
    match recv(&mut a).await {
        ServerEvent::ProgressUpdate { participants } => {
            let bob = participants.iter().find(|p| p.session_id == b_id).unwrap();
            assert_eq!(bob.progress, 40.0);
        }
        other => panic!("expected PROGRESS_UPDATE, got {other:?}"),
    }

    send(&mut a, "UPDATE_PROGRESS", json!({ "typedLength": 5 })).await;
    let finished = recv_until(&mut b, |e| matches!(e, ServerEvent::RaceFinished { .. })).await;
    let ServerEvent::RaceFinished { leaderboard } = finished else {
        unreachable!()
    };
    assert_eq!(leaderboard.len(), 2);
    assert_eq!(leaderboard[0].session_id, a_id);
    assert_eq!(leaderboard[0].rank, Some(1));
    assert_eq!(leaderboard[1].session_id, b_id);
    assert_eq!(leaderboard[1].rank, None);
}

#[tokio::test]
async fn test_join_during_race_rejected() {
    let (addr, _) = start(test_config()).await;
    let (mut a, mut b, room, ..) = two_player_room(&addr).await;
    race_started(&mut a, &mut b).await;

    let mut c = ws(&addr).await;
    send(&mut c, "JOIN_ROOM", json!({ "roomId": room, "username": "cat" })).await;
    assert_eq!(recv(&mut c).await, ServerEvent::error("Race already in progress"));
}

#[tokio::test]
async fn test_time_mode_race_ends_when_clock_runs_out() {
    let (addr, _) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, Some(RaceConfig::Time { duration_seconds: 1 })).await;
    let (_, snapshot) = join_with(&mut a, room.as_str(), "ana", None).await;
    assert_eq!(snapshot.text.len(), 100);

    send(&mut a, "START_RACE", json!({})).await;
    assert!(matches!(recv(&mut a).await, ServerEvent::CountdownStart { .. }));
    assert_eq!(recv(&mut a).await, ServerEvent::RaceStart {});
    match recv(&mut a).await {
        ServerEvent::RaceFinished { leaderboard } => {
            assert_eq!(leaderboard.len(), 1);
            assert_eq!(leaderboard[0].rank, None);
        }
        other => panic!("expected RACE_FINISHED, got {other:?}"),
    }
}

#[tokio::test]
async fn test_time_mode_standings_follow_typing_not_report_time() {
    let (addr, _) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let mut b = ws(&addr).await;
    let room = create_room(&mut a, Some(RaceConfig::Time { duration_seconds: 1 })).await;
    let a_id = join(&mut a, &room, "ana").await;
    let b_id = join(&mut b, &room, "bob").await;
    recv_until(&mut a, |e| matches!(e, ServerEvent::PlayerJoined { .. })).await;
    race_started(&mut a, &mut b).await;

    // Ana types a lot early, Bob a little but reports later.
    send(&mut a, "UPDATE_PROGRESS", json!({ "typedLength": 40 })).await;
    recv_until(&mut b, |e| matches!(e, ServerEvent::ProgressUpdate { .. })).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    send(&mut b, "UPDATE_PROGRESS", json!({ "typedLength": 3 })).await;

    let finished = recv_until(&mut a, |e| matches!(e, ServerEvent::RaceFinished { .. })).await;
    let ServerEvent::RaceFinished { leaderboard } = finished else {
        unreachable!()
    };
    assert_eq!(leaderboard.len(), 2);
    assert_eq!(leaderboard[0].session_id, a_id);
    assert_eq!(leaderboard[1].session_id, b_id);
    assert!(leaderboard[1].progress > leaderboard[0].progress);
}

#[tokio::test]
async fn test_restart_returns_room_to_lobby() {
    let (addr, handle) = start(test_config()).await;
    let (mut a, mut b, room, ..) = two_player_room(&addr).await;
    race_started(&mut a, &mut b).await;
    send(&mut a, "UPDATE_PROGRESS", json!({ "typedLength": 5 })).await;
    recv_until(&mut a, |e| matches!(e, ServerEvent::RaceFinished { .. })).await;

    send(&mut a, "RESTART_GAME", json!({})).await;
    match recv(&mut a).await {
        ServerEvent::RoomUpdate(snapshot) => {
            assert_eq!(snapshot.status, RoomStatus::Lobby);
            assert!(snapshot.participants.iter().all(|p| p.progress == 0.0 && p.rank.is_none()));
        }
        other => panic!("expected ROOM_UPDATE, got {other:?}"),
    }
    let snapshot = handle.room_snapshot(&room).await.unwrap();
    assert_eq!(snapshot.status, RoomStatus::Lobby);
}

// =========================================================================
// Room settings
// =========================================================================

#[tokio::test]
async fn test_transfer_host_promotes_target() {
    let (addr, _) = start(test_config()).await;
    let (mut a, mut b, _, _, b_id) = two_player_room(&addr).await;

    send(&mut a, "TRANSFER_HOST", json!({ "targetId": b_id })).await;
    assert!(matches!(recv(&mut b).await, ServerEvent::HostPromoted { .. }));
    match recv(&mut a).await {
        ServerEvent::RoomUpdate(snapshot) => {
            let host: Vec<_> = snapshot.participants.iter().filter(|p| p.is_host).collect();
            assert_eq!(host.len(), 1);
            assert_eq!(host[0].session_id, b_id);
        }
        other => panic!("expected ROOM_UPDATE, got {other:?}"),
    }

    // The old host has lost the right to start.
    send(&mut a, "START_RACE", json!({})).await;
    assert_eq!(recv(&mut a).await, ServerEvent::error("Only the host can start the race"));
}

#[tokio::test]
async fn test_update_settings_regenerates_text() {
    let (addr, _) = start(test_config()).await;
    let (mut a, mut b, ..) = two_player_room(&addr).await;

    send(
        &mut a,
        "UPDATE_SETTINGS",
        json!({ "config": { "mode": "WORDS", "wordCount": 4 } }),
    )
    .await;
    for ws in [&mut a, &mut b] {
        match recv(ws).await {
            ServerEvent::RoomUpdate(snapshot) => {
                assert_eq!(snapshot.config, RaceConfig::Words { word_count: 4 });
                assert_eq!(snapshot.text.len(), 4);
            }
            other => panic!("expected ROOM_UPDATE, got {other:?}"),
        }
    }

    send(&mut b, "UPDATE_SETTINGS", json!({ "config": { "mode": "TIME", "durationSeconds": 30 } })).await;
    assert_eq!(recv(&mut b).await, ServerEvent::error("Only the host can change settings"));
}

/// Counts how many times text was fetched.
struct CountingWords(Arc<AtomicUsize>);

impl WordSource for CountingWords {
    async fn get_words(&self, count: usize) -> Vec<String> {
        self.0.fetch_add(1, Ordering::SeqCst);
        vec!["go".to_string(); count]
    }
}

#[tokio::test]
async fn test_non_host_settings_change_fetches_no_words() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let server = KeyraceServer::builder()
        .config(test_config())
        .words(CountingWords(Arc::clone(&fetches)))
        .build()
        .await
        .unwrap();
    let (addr, _) = launch(server).await;
    let (_a, mut b, ..) = two_player_room(&addr).await;
    let after_create = fetches.load(Ordering::SeqCst);

    send(&mut b, "UPDATE_SETTINGS", json!({ "config": { "mode": "WORDS", "wordCount": 4 } })).await;
    assert_eq!(recv(&mut b).await, ServerEvent::error("Only the host can change settings"));
    assert_eq!(fetches.load(Ordering::SeqCst), after_create);
}

#[tokio::test]
async fn test_load_more_words_broadcasts_batch() {
    let (addr, handle) = start(test_config()).await;
    let (mut a, mut b, room, ..) = two_player_room(&addr).await;

    send(&mut b, "LOAD_MORE_WORDS", json!({})).await;
    for ws in [&mut a, &mut b] {
        match recv(ws).await {
            ServerEvent::WordsAppended { words } => assert_eq!(words.len(), 50),
            other => panic!("expected WORDS_APPENDED, got {other:?}"),
        }
    }
    assert_eq!(handle.room_snapshot(&room).await.unwrap().text.len(), 52);
}

// =========================================================================
// Leaving and room lifetime
// =========================================================================

#[tokio::test]
async fn test_host_leaving_promotes_next_participant() {
    let (addr, _) = start(test_config()).await;
    let (mut a, mut b, _, a_id, b_id) = two_player_room(&addr).await;

    send(&mut a, "LEAVE_ROOM", json!({})).await;
    assert_eq!(recv(&mut b).await, ServerEvent::PlayerLeft { session_id: a_id });
    assert!(matches!(recv(&mut b).await, ServerEvent::HostPromoted { .. }));
    match recv(&mut b).await {
        ServerEvent::RoomUpdate(snapshot) => {
            assert_eq!(snapshot.participants.len(), 1);
            assert_eq!(snapshot.participants[0].session_id, b_id);
            assert!(snapshot.participants[0].is_host);
        }
        other => panic!("expected ROOM_UPDATE, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejoin_within_grace_keeps_room() {
    let (addr, handle) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, None).await;
    join(&mut a, &room, "ana").await;
    a.close(None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = handle.room_snapshot(&room).await.unwrap();
    assert!(snapshot.participants.is_empty());

    let mut again = ws(&addr).await;
    let (_, snapshot) = join_with(&mut again, room.as_str(), "ana", None).await;
    assert_eq!(snapshot.participants.len(), 1);
    assert!(snapshot.participants[0].is_host);

    // Well past the original deadline.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(handle.room_snapshot(&room).await.is_some());
}

#[tokio::test]
async fn test_empty_room_deleted_after_grace() {
    let (addr, handle) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, None).await;
    join(&mut a, &room, "ana").await;
    a.close(None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(handle.room_snapshot(&room).await.is_none());
    assert_eq!(handle.room_count().await, 0);

    let mut b = ws(&addr).await;
    send(&mut b, "JOIN_ROOM", json!({ "roomId": room, "username": "bob" })).await;
    assert_eq!(recv(&mut b).await, ServerEvent::error(format!("Room {room} not found")));
}

#[tokio::test]
async fn test_no_grace_deletes_immediately() {
    let config = ServerConfig {
        grace_period: None,
        ..test_config()
    };
    let (addr, handle) = start(config).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, None).await;
    join(&mut a, &room, "ana").await;

    send(&mut a, "LEAVE_ROOM", json!({})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.room_snapshot(&room).await.is_none());
}

#[tokio::test]
async fn test_idle_sweep_removes_quiet_host_and_unjoined_room() {
    let config = ServerConfig {
        idle_threshold: Duration::from_millis(200),
        ..test_config()
    };
    let (addr, handle) = start(config).await;
    let (mut a, mut b, room, a_id, b_id) = two_player_room(&addr).await;
    let unjoined = handle.create_room(None, None).await.unwrap();
    assert_eq!(handle.room_count().await, 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    // Bob does something; Ana stays quiet.
    send(&mut b, "LOAD_MORE_WORDS", json!({})).await;
    recv_until(&mut b, |e| matches!(e, ServerEvent::WordsAppended { .. })).await;

    handle.sweep_idle().await;

    let left = recv_until(&mut a, |e| matches!(e, ServerEvent::PlayerLeft { .. })).await;
    assert_eq!(left, ServerEvent::PlayerLeft { session_id: a_id.clone() });
    assert_eq!(recv(&mut b).await, ServerEvent::PlayerLeft { session_id: a_id });
    assert!(matches!(recv(&mut b).await, ServerEvent::HostPromoted { .. }));

    let snapshot = handle.room_snapshot(&room).await.unwrap();
    assert_eq!(snapshot.participants.len(), 1);
    assert_eq!(snapshot.participants[0].session_id, b_id);
    assert!(snapshot.participants[0].is_host);

    assert!(handle.room_snapshot(&unjoined).await.is_none());
    assert_eq!(handle.room_count().await, 1);
}

#[tokio::test]
async fn test_room_emptied_by_sweep_is_deleted_after_grace() {
    let config = ServerConfig {
        idle_threshold: Duration::from_millis(200),
        ..test_config()
    };
    let (addr, handle) = start(config).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, None).await;
    join(&mut a, &room, "ana").await;

    // A brief visit keeps the room itself fresh while Ana goes idle.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let mut c = ws(&addr).await;
    join(&mut c, &room, "cat").await;
    send(&mut c, "LEAVE_ROOM", json!({})).await;
    recv_until(&mut a, |e| matches!(e, ServerEvent::PlayerLeft { .. })).await;

    handle.sweep_idle().await;
    let snapshot = handle.room_snapshot(&room).await.unwrap();
    assert!(snapshot.participants.is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.room_count().await, 0);
}

#[tokio::test]
async fn test_heartbeat_terminates_silent_connection() {
    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..test_config()
    };
    let (addr, handle) = start(config).await;

    // A client that keeps reading answers pings automatically.
    let mut lively = ws(&addr).await;
    let reader = tokio::spawn(async move { while let Some(Ok(_)) = lively.next().await {} });

    // One that never reads never pongs.
    let _silent = ws(&addr).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.connection_count().await, 2);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(handle.connection_count().await, 1);
    reader.abort();
}

#[tokio::test]
async fn test_stalled_handshake_does_not_block_other_clients() {
    let config = ServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (addr, handle) = start(config).await;

    // Opens a socket and never sends the upgrade request.
    let mut stalled = tokio::net::TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let client = tokio::time::timeout(
        Duration::from_secs(2),
        tokio_tungstenite::connect_async(format!("ws://{addr}")),
    )
    .await;
    assert!(matches!(client, Ok(Ok(_))), "a real client gets through");

    // The server gives up on the stalled socket and closes it.
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stalled.read(&mut buf))
        .await
        .expect("stalled socket should be closed");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(handle.connection_count().await, 1);
}

// =========================================================================
// Results
// =========================================================================

async fn start_signed() -> (
    String,
    Arc<InMemoryResultStore>,
    ServerHandle<StaticTokens, InMemoryRoomDirectory, StaticWordSource, Arc<InMemoryResultStore>>,
) {
    let store = Arc::new(InMemoryResultStore::new());
    let server = KeyraceServer::builder()
        .config(test_config())
        .result_secret("s3cret")
        .words(words())
        .authenticator(StaticTokens::new().with("tok-ana", "user-ana"))
        .results(Arc::clone(&store))
        .build()
        .await
        .unwrap();
    let (addr, handle) = launch(server).await;
    (addr, store, handle)
}

/// Signed-in racer who has just finished a solo "go go" race.
async fn finished_solo(addr: &str) -> Ws {
    let mut a = ws(addr).await;
    let room = create_room(&mut a, None).await;
    join_with(&mut a, room.as_str(), "ana", Some("tok-ana")).await;
    send(&mut a, "START_RACE", json!({})).await;
    recv_until(&mut a, |e| *e == ServerEvent::RaceStart {}).await;
    send(&mut a, "UPDATE_PROGRESS", json!({ "typedLength": 5 })).await;
    recv_until(&mut a, |e| matches!(e, ServerEvent::RaceFinished { .. })).await;
    a
}

#[tokio::test]
async fn test_signed_result_is_recomputed_and_saved() {
    let (addr, store, _) = start_signed().await;
    let mut a = finished_solo(&addr).await;

    let mut result = submission(60.0, 100.0, "go go");
    result.hash = SignedFields::from_submission(&result, "go go").digest("s3cret");
    send(&mut a, "SUBMIT_RESULT", serde_json::to_value(&result).unwrap()).await;

    match recv(&mut a).await {
        ServerEvent::RoomUpdate(snapshot) => {
            assert_eq!(snapshot.participants[0].accuracy, 100.0);
        }
        other => panic!("expected ROOM_UPDATE, got {other:?}"),
    }
    assert_eq!(recv(&mut a).await, ServerEvent::ResultSaved { success: true });

    let saved = store.results().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].record.user_id, Some(UserId("user-ana".into())));
    assert_eq!(saved[0].record.target_text, "go go");
    assert_eq!(saved[0].record.accuracy, 100.0);
    assert!(saved[0].record.net_wpm > 0.0);
    assert!(saved[0].record.net_wpm <= saved[0].record.raw);
    assert_eq!(saved[0].record.replay_data.len(), 5);
}

#[tokio::test]
async fn test_tampered_result_is_rejected() {
    let (addr, store, _) = start_signed().await;
    let mut a = finished_solo(&addr).await;

    let mut result = submission(60.0, 100.0, "go go");
    result.hash = SignedFields::from_submission(&result, "go go").digest("s3cret");
    result.wpm = 250.0;
    send(&mut a, "SUBMIT_RESULT", serde_json::to_value(&result).unwrap()).await;

    assert_eq!(recv(&mut a).await, ServerEvent::ResultSaved { success: false });
    assert_eq!(recv(&mut a).await, ServerEvent::error("result hash mismatch"));
    assert!(store.results().await.is_empty());
}

#[tokio::test]
async fn test_guest_result_is_not_stored() {
    let (addr, _) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, None).await;
    join(&mut a, &room, "ana").await;
    send(&mut a, "START_RACE", json!({})).await;
    recv_until(&mut a, |e| *e == ServerEvent::RaceStart {}).await;

    send(
        &mut a,
        "SUBMIT_RESULT",
        serde_json::to_value(submission(10.0, 100.0, "go")).unwrap(),
    )
    .await;
    match recv(&mut a).await {
        ServerEvent::RoomUpdate(snapshot) => assert_eq!(snapshot.participants[0].accuracy, 100.0),
        other => panic!("expected ROOM_UPDATE, got {other:?}"),
    }
}

#[tokio::test]
async fn test_submit_before_race_errors() {
    let (addr, _) = start(test_config()).await;
    let mut a = ws(&addr).await;
    let room = create_room(&mut a, None).await;
    join(&mut a, &room, "ana").await;

    send(
        &mut a,
        "SUBMIT_RESULT",
        serde_json::to_value(submission(10.0, 100.0, "go")).unwrap(),
    )
    .await;
    assert!(matches!(recv(&mut a).await, ServerEvent::Error { .. }));
}
