//! Integration tests for rooms, their actors, and the directory.

use keyrace_protocol::{RaceConfig, ReplayEvent, RoomId, RoomStatus, ServerEvent, SessionId};
use keyrace_room::{
    InMemoryRoomDirectory, Room, RoomDirectory, RoomError, generate_room_id, spawn_room,
};
use keyrace_session::Outbound;
use tokio::sync::mpsc;

// =========================================================================
// Helpers
// =========================================================================

fn sid(id: &str) -> SessionId {
    SessionId(id.into())
}

fn words_room(id: &str, text: &[&str]) -> Room {
    Room::new(
        RoomId(id.into()),
        RaceConfig::Words { word_count: text.len() as u32 },
        text.iter().map(|w| w.to_string()).collect(),
        None,
        0,
    )
}

fn keys(text: &str) -> Vec<ReplayEvent> {
    text.chars()
        .enumerate()
        .map(|(i, c)| ReplayEvent::key(c.to_string(), i as i64 * 150))
        .collect()
}

/// Small deterministic generator so property loops are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn host_count(room: &Room) -> usize {
    room.participants().iter().filter(|p| p.is_host()).count()
}

// =========================================================================
// State machine
// =========================================================================

#[test]
fn test_every_illegal_transition_leaves_status_unchanged() {
    // Drive a room into each status and try every forcing operation.
    let mut lobby = words_room("SM0001", &["a"]);
    lobby.add_participant(sid("p"), "p", None, 0).unwrap();
    assert!(lobby.start_racing(1).is_err());
    assert!(lobby.finish_racing().is_err());
    assert!(lobby.cancel_countdown().is_err());
    assert_eq!(lobby.status(), RoomStatus::Lobby);

    let mut countdown = lobby.clone();
    countdown.start_race().unwrap();
    assert!(countdown.start_race().is_err());
    assert!(countdown.finish_racing().is_err());
    assert_eq!(countdown.status(), RoomStatus::Countdown);

    let mut finished = countdown.clone();
    finished.start_racing(10).unwrap();
    finished.finish_racing().unwrap();
    assert!(finished.start_race().is_err());
    assert!(finished.start_racing(20).is_err());
    assert!(finished.finish_racing().is_err());
    assert_eq!(finished.status(), RoomStatus::Finished);
    assert_eq!(finished.race_started_at(), Some(10));

    finished.restart(vec!["b".into()]).unwrap();
    assert_eq!(finished.status(), RoomStatus::Lobby);
    assert_eq!(finished.race_started_at(), None);
}

#[test]
fn test_countdown_cancel_and_force_stop_return_to_lobby() {
    let mut room = words_room("SM0002", &["a"]);
    room.add_participant(sid("p"), "p", None, 0).unwrap();
    room.start_race().unwrap();
    room.cancel_countdown().unwrap();
    assert_eq!(room.status(), RoomStatus::Lobby);

    room.start_race().unwrap();
    room.start_racing(5).unwrap();
    room.restart(vec!["a".into()]).unwrap();
    assert_eq!(room.status(), RoomStatus::Lobby);
    assert_eq!(room.race_started_at(), None);
}

// =========================================================================
// Invariants under random operation sequences
// =========================================================================

#[test]
fn test_exactly_one_host_after_random_add_remove() {
    let mut rng = Lcg(7);
    for round in 0..50 {
        let mut room = words_room("HOST01", &["x"]);
        let mut present: Vec<SessionId> = Vec::new();
        let mut next_id = 0;

        for _ in 0..40 {
            if present.is_empty() || rng.next() % 3 != 0 {
                let id = sid(&format!("r{round}-{next_id}"));
                next_id += 1;
                room.add_participant(id.clone(), "racer", None, 0).unwrap();
                present.push(id);
            } else {
                let idx = (rng.next() as usize) % present.len();
                let id = present.swap_remove(idx);
                room.remove_participant(&id).unwrap();
            }

            if room.is_empty() {
                assert_eq!(host_count(&room), 0);
            } else {
                assert_eq!(host_count(&room), 1, "round {round}");
            }
        }
    }
}

#[test]
fn test_ranks_strictly_increase_from_one() {
    let mut rng = Lcg(42);
    let ids: Vec<SessionId> = (0..6).map(|i| sid(&format!("p{i}"))).collect();
    let mut room = words_room("RANK01", &["alpha", "beta"]);
    for id in &ids {
        room.add_participant(id.clone(), "racer", None, 0).unwrap();
    }
    room.start_race().unwrap();
    room.start_racing(0).unwrap();

    let target = room.strategy().target_length(room.text());
    let mut assigned = Vec::new();
    let mut now = 0;
    while room.status() == RoomStatus::Racing {
        now += 100;
        let id = &ids[(rng.next() as usize) % ids.len()];
        let typed = (rng.next() as usize) % (target + 2);
        let outcome = room.update_participant_progress(id, typed, now).unwrap();
        if outcome.participant_finished {
            assigned.push(room.participant(id).unwrap().rank().unwrap());
        }
    }

    let expected: Vec<u32> = (1..=ids.len() as u32).collect();
    assert_eq!(assigned, expected);
}

#[test]
fn test_rank_not_reused_after_finisher_leaves() {
    let mut room = words_room("RANK02", &["hello", "world"]);
    for id in ["a", "b", "c"] {
        room.add_participant(sid(id), id, None, 0).unwrap();
    }
    room.start_race().unwrap();
    room.start_racing(0).unwrap();

    room.update_participant_progress(&sid("a"), 11, 1_000).unwrap();
    assert_eq!(room.participant(&sid("a")).unwrap().rank(), Some(1));
    room.remove_participant(&sid("a")).unwrap();

    let outcome = room.update_participant_progress(&sid("b"), 11, 2_000).unwrap();
    assert!(outcome.participant_finished);
    assert_eq!(room.participant(&sid("b")).unwrap().rank(), Some(2));
}

// =========================================================================
// Scenarios
// =========================================================================

#[test]
fn test_final_stats_hello_wor_after_one_minute() {
    let mut room = words_room("SCEN01", &["hello", "world"]);
    room.add_participant(sid("a"), "ana", None, 0).unwrap();
    room.add_participant(sid("b"), "bob", None, 0).unwrap();
    room.start_race().unwrap();
    room.start_racing(1_000).unwrap();

    let stats = room
        .get_participant_final_stats(&sid("a"), &keys("hello wor"), 61_000)
        .unwrap();
    assert_eq!(stats.accuracy, 100.0);
    assert_eq!(stats.wpm, 1.8);
}

#[test]
fn test_first_finisher_ranked_first_on_leaderboard() {
    let mut room = words_room("SCEN02", &["hello", "world"]);
    room.add_participant(sid("a"), "ana", None, 0).unwrap();
    room.add_participant(sid("b"), "bob", None, 0).unwrap();
    room.start_race().unwrap();
    room.start_racing(0).unwrap();

    room.update_participant_progress(&sid("b"), 4, 2_000).unwrap();
    let outcome = room.update_participant_progress(&sid("a"), 11, 3_000).unwrap();
    assert!(outcome.participant_finished);

    // First finisher ends the race for everyone.
    room.finish_racing().unwrap();
    assert_eq!(room.status(), RoomStatus::Finished);

    let board = room.leaderboard();
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].session_id, sid("a"));
    assert_eq!(board[0].rank, Some(1));
    assert_eq!(board[1].session_id, sid("b"));
    assert_eq!(board[1].rank, None);
}

// =========================================================================
// Actor and directory
// =========================================================================

#[tokio::test]
async fn test_actor_serializes_concurrent_progress_updates() {
    let mut room = words_room("ACT001", &["hello", "world"]);
    for id in ["a", "b", "c", "d"] {
        room.add_participant(sid(id), id, None, 0).unwrap();
    }
    room.start_race().unwrap();
    room.start_racing(0).unwrap();
    let handle = spawn_room(room);

    let mut tasks = Vec::new();
    for id in ["a", "b", "c", "d"] {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle
                .try_run(move |ctx| ctx.room_mut().update_participant_progress(&sid(id), 11, 1_000))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let (status, mut ranks) = handle
        .run(|ctx| {
            let ranks: Vec<u32> =
                ctx.room().participants().iter().filter_map(|p| p.rank()).collect();
            (ctx.room().status(), ranks)
        })
        .await
        .unwrap();
    ranks.sort_unstable();
    assert_eq!(status, RoomStatus::Finished);
    assert_eq!(ranks, [1, 2, 3, 4]);
}

#[tokio::test]
async fn test_actor_broadcast_reaches_attached_members() {
    let handle = spawn_room(words_room("ACT002", &["a"]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle
        .try_run(move |ctx| {
            ctx.room_mut().add_participant(sid("a"), "ana", None, 0)?;
            ctx.attach(sid("a"), tx);
            ctx.broadcast(ServerEvent::RaceStart {});
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(rx.recv().await, Some(Outbound::Event(ServerEvent::RaceStart {})));
}

#[tokio::test]
async fn test_directory_save_find_delete() {
    let directory = InMemoryRoomDirectory::new();
    let handle = spawn_room(words_room("DIR001", &["a"]));

    directory.save(handle.clone()).await;
    assert!(directory.find_by_id(&RoomId("DIR001".into())).await.is_some());
    assert_eq!(directory.list_all().await.len(), 1);

    let removed = directory.delete(&RoomId("DIR001".into())).await;
    assert!(removed.is_some());
    assert!(directory.find_by_id(&RoomId("DIR001".into())).await.is_none());
    assert!(directory.is_empty().await);
}

#[tokio::test]
async fn test_directory_insert_new_rejects_collision() {
    let directory = InMemoryRoomDirectory::new();
    let id = generate_room_id();
    let first = spawn_room(words_room(id.as_str(), &["a"]));
    let second = spawn_room(words_room(id.as_str(), &["b"]));

    assert!(directory.insert_new(first).await);
    assert!(!directory.insert_new(second).await);

    let kept = directory.find_by_id(&id).await.unwrap();
    let text = kept.run(|ctx| ctx.room().text().to_vec()).await.unwrap();
    assert_eq!(text, ["a"]);
}

#[tokio::test]
async fn test_closed_room_reports_unavailable() {
    let handle = spawn_room(words_room("DIR002", &["a"]));
    handle.run(|ctx| ctx.close()).await.unwrap();
    let err = handle.run(|ctx| ctx.room().participant_count()).await.unwrap_err();
    assert_eq!(err, RoomError::Unavailable(RoomId("DIR002".into())));
}
