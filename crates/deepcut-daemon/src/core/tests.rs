use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deepcut_proto::protocol::{Command, Track};
use deepcut_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};

use super::{PlayerCore, PlayerEvent};
use crate::engine::{EngineStatus, LoadError, PlaybackEngine, StatusPush, StatusSink};
use crate::BroadcastMessage;

// ── recording fake engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Load(String),
    Pause,
    Resume,
    Seek(u64),
    Poll,
    Unload,
}

#[derive(Default)]
struct Shared {
    calls: Vec<Call>,
    sink: Option<StatusSink>,
    status: Option<EngineStatus>,
    fail_loads: bool,
}

#[derive(Clone, Default)]
struct FakeEngine {
    shared: Arc<Mutex<Shared>>,
}

impl FakeEngine {
    fn calls(&self) -> Vec<Call> {
        self.shared.lock().unwrap().calls.clone()
    }

    /// Calls that change the audio output; polling is not one of them.
    fn transport_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| *c != Call::Poll)
            .collect()
    }

    fn loads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Load(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    fn take_sink(&self) -> StatusSink {
        self.shared.lock().unwrap().sink.take().expect("no live session")
    }

    fn push(&self, status: EngineStatus) {
        let mut shared = self.shared.lock().unwrap();
        shared.status = Some(status);
        shared.sink.as_mut().expect("no live session").push(status);
    }

    fn finish(&self) {
        let sink = self.take_sink();
        let mut shared = self.shared.lock().unwrap();
        let status = EngineStatus {
            is_playing: false,
            ..shared.status.unwrap_or_default()
        };
        shared.status = None;
        sink.finish(status);
    }

    fn fail_loads(&self, fail: bool) {
        self.shared.lock().unwrap().fail_loads = fail;
    }
}

#[async_trait]
impl PlaybackEngine for FakeEngine {
    async fn load(&mut self, url: &str, sink: StatusSink) -> Result<(), LoadError> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(Call::Load(url.to_string()));
        shared.sink = None;
        shared.status = None;
        if shared.fail_loads {
            return Err(LoadError::Open {
                url: url.to_string(),
                reason: "no such file".to_string(),
            });
        }
        shared.sink = Some(sink);
        shared.status = Some(EngineStatus {
            is_playing: true,
            is_loaded: true,
            ..Default::default()
        });
        Ok(())
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(Call::Pause);
        if let Some(status) = shared.status.as_mut() {
            status.is_playing = false;
        }
        Ok(())
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(Call::Resume);
        if let Some(status) = shared.status.as_mut() {
            status.is_playing = true;
        }
        Ok(())
    }

    async fn seek(&mut self, ms: u64) -> anyhow::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(Call::Seek(ms));
        if let Some(status) = shared.status.as_mut() {
            status.position_ms = ms;
        }
        Ok(())
    }

    async fn poll_status(&mut self) -> Option<EngineStatus> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(Call::Poll);
        shared.status
    }

    async fn unload(&mut self) -> anyhow::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(Call::Unload);
        shared.sink = None;
        shared.status = None;
        Ok(())
    }
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        title: format!("Track {id}"),
        artist: "Artist".to_string(),
        artwork_url: None,
        stream_url: format!("https://example.test/tracks/{id}/stream"),
    }
}

fn url(id: &str) -> String {
    track(id).stream_url
}

fn tracks(ids: &[&str]) -> Vec<Track> {
    ids.iter().map(|id| track(id)).collect()
}

fn new_core() -> (PlayerCore<FakeEngine>, FakeEngine) {
    let fake = FakeEngine::default();
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(64);
    let core = PlayerCore::new(fake.clone(), Arc::new(StateManager::new()), broadcast_tx, 0);
    (core, fake)
}

/// Core with `ids` queued and `active` loaded.
async fn playing_core(ids: &[&str], active: usize) -> (PlayerCore<FakeEngine>, FakeEngine) {
    let (mut core, fake) = new_core();
    core.set_queue(tracks(ids)).await;
    core.play_at(active).await;
    (core, fake)
}

fn queue_ids(core: &PlayerCore<FakeEngine>) -> Vec<String> {
    core.snapshot().queue.into_iter().map(|t| t.id).collect()
}

fn current_id(core: &PlayerCore<FakeEngine>) -> Option<String> {
    core.snapshot().current.map(|t| t.id)
}

fn assert_invariant(core: &PlayerCore<FakeEngine>) {
    let snap = core.snapshot();
    let in_range = !snap.queue.is_empty() && snap.active_index < snap.queue.len();
    assert_eq!(snap.current.is_some(), in_range, "current out of sync: {:?}", snap);
    if snap.queue.is_empty() {
        assert_eq!(snap.active_index, 0);
    }
    if let Some(current) = &snap.current {
        assert_eq!(current, &snap.queue[snap.active_index]);
    }
}

// ── properties ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invariant_holds_across_operations() {
    let (mut core, fake) = new_core();
    assert_invariant(&core);

    core.set_queue(tracks(&["a", "b", "c"])).await;
    assert_invariant(&core);
    core.play_at(2).await;
    assert_invariant(&core);
    core.enqueue_next(track("d")).await;
    assert_invariant(&core);
    core.enqueue_last(track("e")).await;
    assert_invariant(&core);
    core.prev().await;
    assert_invariant(&core);
    core.remove_at(0).await;
    assert_invariant(&core);
    core.jump_to(99).await;
    assert_invariant(&core);
    fake.finish();
    core.pump_status().await;
    assert_invariant(&core);
    core.remove_at(core.snapshot().active_index).await;
    assert_invariant(&core);
    core.set_queue(Vec::new()).await;
    assert_invariant(&core);
    core.clear_queue().await;
    assert_invariant(&core);
}

#[tokio::test]
async fn test_next_at_last_index_is_noop() {
    let (mut core, fake) = playing_core(&["a", "b", "c"], 2).await;
    let before = core.snapshot();
    let calls = fake.calls();

    core.next().await;

    assert_eq!(core.snapshot(), before);
    assert_eq!(fake.calls(), calls);
}

#[tokio::test]
async fn test_prev_at_first_index_is_noop() {
    let (mut core, fake) = playing_core(&["a", "b"], 0).await;
    let calls = fake.calls();
    core.prev().await;
    assert_eq!(fake.calls(), calls);
    assert_eq!(core.snapshot().active_index, 0);
}

#[tokio::test]
async fn test_finished_push_advances_queue() {
    let (mut core, fake) = playing_core(&["a", "b", "c"], 0).await;

    fake.push(EngineStatus {
        position_ms: 29_000,
        duration_ms: 30_000,
        is_playing: true,
        is_loaded: true,
    });
    fake.finish();
    core.pump_status().await;

    let snap = core.snapshot();
    assert_eq!(snap.active_index, 1);
    assert_eq!(current_id(&core).as_deref(), Some("b"));
    assert!(snap.is_playing);
    assert_eq!(snap.position_ms, 0);
    assert_eq!(fake.loads(), vec![url("a"), url("b")]);
}

#[tokio::test]
async fn test_finished_on_last_track_stops() {
    let (mut core, fake) = playing_core(&["a"], 0).await;
    fake.finish();
    core.pump_status().await;

    let snap = core.snapshot();
    assert_eq!(snap.active_index, 0);
    assert!(!snap.is_playing);
    assert_eq!(fake.loads(), vec![url("a")]);
}

#[tokio::test]
async fn test_enqueue_next_inserts_after_active() {
    let (mut core, fake) = playing_core(&["a", "b", "c"], 0).await;
    let calls = fake.calls();

    core.enqueue_next(track("d")).await;

    assert_eq!(queue_ids(&core), vec!["a", "d", "b", "c"]);
    assert_eq!(core.snapshot().active_index, 0);
    assert_eq!(fake.calls(), calls);
}

#[tokio::test]
async fn test_enqueue_last_appends() {
    let (mut core, fake) = playing_core(&["a", "b"], 1).await;
    let calls = fake.calls();

    core.enqueue_last(track("z")).await;

    assert_eq!(queue_ids(&core), vec!["a", "b", "z"]);
    assert_eq!(current_id(&core).as_deref(), Some("b"));
    assert_eq!(fake.calls(), calls);
}

#[tokio::test]
async fn test_enqueue_when_idle_starts_playback() {
    let (mut core, fake) = new_core();
    core.enqueue_last(track("x")).await;

    assert_eq!(queue_ids(&core), vec!["x"]);
    assert_eq!(current_id(&core).as_deref(), Some("x"));
    assert!(core.snapshot().is_playing);
    assert_eq!(fake.loads(), vec![url("x")]);

    let (mut core, fake) = new_core();
    core.enqueue_next(track("y")).await;
    assert_eq!(queue_ids(&core), vec!["y"]);
    assert_eq!(fake.loads(), vec![url("y")]);
}

#[tokio::test]
async fn test_remove_active_plays_successor() {
    let (mut core, fake) = playing_core(&["a", "b", "c"], 1).await;

    core.remove_at(1).await;

    assert_eq!(queue_ids(&core), vec!["a", "c"]);
    assert_eq!(core.snapshot().active_index, 1);
    assert_eq!(fake.loads().last(), Some(&url("c")));
}

#[tokio::test]
async fn test_remove_active_last_plays_predecessor() {
    let (mut core, fake) = playing_core(&["a", "b"], 1).await;

    core.remove_at(1).await;

    assert_eq!(queue_ids(&core), vec!["a"]);
    assert_eq!(core.snapshot().active_index, 0);
    assert_eq!(fake.loads().last(), Some(&url("a")));
}

#[tokio::test]
async fn test_remove_only_track_releases_session() {
    let (mut core, fake) = playing_core(&["a"], 0).await;
    let calls_before = fake.calls().len();

    core.remove_at(0).await;

    let snap = core.snapshot();
    assert!(snap.queue.is_empty());
    assert_eq!(snap.active_index, 0);
    assert!(snap.current.is_none());
    assert!(!snap.is_playing);
    assert_eq!(fake.calls()[calls_before..], [Call::Unload]);
    assert_eq!(fake.loads(), vec![url("a")]);
}

#[tokio::test]
async fn test_remove_other_positions_keep_playing() {
    let (mut core, fake) = playing_core(&["a", "b", "c"], 1).await;
    let calls = fake.calls();

    core.remove_at(0).await;
    assert_eq!(queue_ids(&core), vec!["b", "c"]);
    assert_eq!(current_id(&core).as_deref(), Some("b"));

    core.remove_at(1).await;
    assert_eq!(queue_ids(&core), vec!["b"]);
    assert_eq!(current_id(&core).as_deref(), Some("b"));

    core.remove_at(7).await;
    assert_eq!(queue_ids(&core), vec!["b"]);
    assert_eq!(fake.calls(), calls);
}

#[tokio::test]
async fn test_seek_updates_position_immediately() {
    let (mut core, fake) = playing_core(&["a"], 0).await;
    fake.push(EngineStatus {
        position_ms: 1_000,
        duration_ms: 30_000,
        is_playing: true,
        is_loaded: true,
    });
    core.pump_status().await;

    core.seek(15_000).await;

    let snap = core.snapshot();
    assert_eq!(snap.position_ms, 15_000);
    assert_eq!(snap.duration_ms, 30_000);
    assert_eq!(fake.transport_calls().last(), Some(&Call::Seek(15_000)));
}

#[tokio::test]
async fn test_seek_without_track_keeps_position() {
    let (mut core, _fake) = new_core();
    core.seek(5_000).await;
    assert_eq!(core.snapshot().position_ms, 0);
}

#[tokio::test]
async fn test_play_at_out_of_bounds_is_noop() {
    let (mut core, fake) = new_core();
    core.set_queue(tracks(&["a"])).await;
    core.play_at(3).await;
    assert!(fake.calls().is_empty());
    assert!(!core.snapshot().is_playing);
}

#[tokio::test]
async fn test_set_queue_keeps_index() {
    let (mut core, fake) = playing_core(&["a", "b", "c"], 2).await;
    let calls = fake.calls();

    core.set_queue(tracks(&["x", "y", "z", "w"])).await;
    assert_eq!(core.snapshot().active_index, 2);
    assert_eq!(current_id(&core).as_deref(), Some("z"));

    core.set_queue(tracks(&["x"])).await;
    assert!(core.snapshot().current.is_none());

    core.set_queue(Vec::new()).await;
    assert_eq!(core.snapshot().active_index, 0);
    assert_eq!(fake.calls(), calls);
}

#[tokio::test]
async fn test_stale_generation_is_dropped() {
    let (mut core, fake) = playing_core(&["a", "b"], 0).await;
    let mut old = fake.take_sink();

    core.play_at(1).await;
    old.push(EngineStatus {
        position_ms: 42_000,
        duration_ms: 60_000,
        is_playing: true,
        is_loaded: true,
    });
    old.finish(EngineStatus::default());
    core.pump_status().await;

    let snap = core.snapshot();
    assert_eq!(snap.active_index, 1);
    assert_eq!(snap.position_ms, 0);
    assert_eq!(snap.duration_ms, 0);
    assert_eq!(fake.loads(), vec![url("a"), url("b")]);
}

#[tokio::test]
async fn test_out_of_order_push_is_dropped() {
    let (mut core, _fake) = playing_core(&["a"], 0).await;
    let generation = core.generation;
    let status = |position_ms| EngineStatus {
        position_ms,
        duration_ms: 30_000,
        is_playing: true,
        is_loaded: true,
    };

    core.handle_status(StatusPush {
        generation,
        seq: 2,
        status: status(2_000),
        finished: false,
    })
    .await;
    core.handle_status(StatusPush {
        generation,
        seq: 1,
        status: status(1_000),
        finished: false,
    })
    .await;
    core.handle_status(StatusPush {
        generation,
        seq: 2,
        status: status(1_500),
        finished: false,
    })
    .await;

    assert_eq!(core.snapshot().position_ms, 2_000);
}

#[tokio::test]
async fn test_load_failure_corrects_playing_flag() {
    let (mut core, fake) = new_core();
    fake.fail_loads(true);
    core.set_queue(tracks(&["a", "b"])).await;

    core.play_at(1).await;

    let snap = core.snapshot();
    assert_eq!(snap.active_index, 1);
    assert_eq!(current_id(&core).as_deref(), Some("b"));
    assert!(!snap.is_playing);
    assert!(snap.last_error.as_deref().unwrap().contains("no such file"));

    fake.fail_loads(false);
    core.play_at(0).await;
    assert!(core.snapshot().last_error.is_none());
    assert!(core.snapshot().is_playing);
}

#[tokio::test]
async fn test_load_failure_sends_notice() {
    let fake = FakeEngine::default();
    fake.fail_loads(true);
    let (broadcast_tx, mut broadcast_rx) = broadcast::channel::<BroadcastMessage>(64);
    let mut core = PlayerCore::new(fake.clone(), Arc::new(StateManager::new()), broadcast_tx, 0);

    core.enqueue_last(track("a")).await;

    let mut notices = Vec::new();
    while let Ok(msg) = broadcast_rx.try_recv() {
        if let BroadcastMessage::Notice(text) = msg {
            notices.push(text);
        }
    }
    assert_eq!(notices.len(), 1);
    assert!(notices[0].contains("Track a"));
}

#[tokio::test]
async fn test_toggle_without_session_makes_no_engine_call() {
    let (mut core, fake) = new_core();
    core.toggle().await;
    assert!(fake.transport_calls().is_empty());
    assert!(!core.snapshot().is_playing);
}

#[tokio::test]
async fn test_toggle_pauses_and_resumes() {
    let (mut core, fake) = playing_core(&["a"], 0).await;

    core.toggle().await;
    assert!(!core.snapshot().is_playing);
    assert_eq!(fake.transport_calls().last(), Some(&Call::Pause));

    core.toggle().await;
    assert!(core.snapshot().is_playing);
    assert_eq!(fake.transport_calls().last(), Some(&Call::Resume));
}

#[tokio::test]
async fn test_toggle_trusts_engine_over_local_flag() {
    let (mut core, fake) = playing_core(&["a"], 0).await;
    // engine paused on its own; local state still says playing
    fake.shared.lock().unwrap().status = Some(EngineStatus {
        is_playing: false,
        is_loaded: true,
        ..Default::default()
    });

    core.toggle().await;

    assert!(core.snapshot().is_playing);
    assert_eq!(fake.transport_calls().last(), Some(&Call::Resume));
}

#[tokio::test]
async fn test_clear_queue_pauses_unloads_and_resets() {
    let (mut core, fake) = playing_core(&["a", "b"], 1).await;
    let calls_before = fake.transport_calls().len();

    core.clear_queue().await;

    assert_eq!(
        fake.transport_calls()[calls_before..],
        [Call::Pause, Call::Unload]
    );
    let snap = core.snapshot();
    assert!(snap.queue.is_empty());
    assert!(snap.current.is_none());
    assert!(!snap.is_playing);
    assert_eq!((snap.position_ms, snap.duration_ms), (0, 0));
}

#[tokio::test]
async fn test_tick_folds_loaded_status() {
    let (mut core, fake) = playing_core(&["a"], 0).await;
    fake.shared.lock().unwrap().status = Some(EngineStatus {
        position_ms: 7_000,
        duration_ms: 20_000,
        is_playing: true,
        is_loaded: true,
    });

    core.tick().await;
    assert_eq!(core.snapshot().position_ms, 7_000);

    fake.shared.lock().unwrap().status = Some(EngineStatus {
        position_ms: 9_000,
        is_loaded: false,
        ..Default::default()
    });
    core.tick().await;
    assert_eq!(core.snapshot().position_ms, 7_000);
}

#[tokio::test]
async fn test_tick_supersedes_queued_push() {
    let (mut core, fake) = playing_core(&["a"], 0).await;
    fake.push(EngineStatus {
        position_ms: 3_000,
        duration_ms: 30_000,
        is_playing: true,
        is_loaded: true,
    });
    fake.shared.lock().unwrap().status = Some(EngineStatus {
        position_ms: 9_000,
        duration_ms: 30_000,
        is_playing: true,
        is_loaded: true,
    });

    core.tick().await;
    core.pump_status().await;
    assert_eq!(core.snapshot().position_ms, 9_000);

    // pushes issued after the poll still apply
    fake.push(EngineStatus {
        position_ms: 10_000,
        duration_ms: 30_000,
        is_playing: true,
        is_loaded: true,
    });
    core.pump_status().await;
    assert_eq!(core.snapshot().position_ms, 10_000);
}

#[tokio::test]
async fn test_seek_supersedes_queued_push() {
    let (mut core, fake) = playing_core(&["a"], 0).await;
    fake.push(EngineStatus {
        position_ms: 3_000,
        duration_ms: 30_000,
        is_playing: true,
        is_loaded: true,
    });

    core.seek(15_000).await;
    core.pump_status().await;
    assert_eq!(core.snapshot().position_ms, 15_000);
}

#[tokio::test]
async fn test_finish_queued_before_seek_still_advances() {
    let (mut core, fake) = playing_core(&["a", "b"], 0).await;
    fake.finish();

    core.seek(1_000).await;
    core.pump_status().await;

    let snap = core.snapshot();
    assert_eq!(current_id(&core).as_deref(), Some("b"));
    assert!(snap.is_playing);
    assert_eq!(snap.position_ms, 0);
    assert_eq!(fake.loads(), vec![url("a"), url("b")]);
}

#[tokio::test]
async fn test_clear_queue_never_resumes() {
    let (mut core, fake) = playing_core(&["a", "b"], 0).await;
    // engine paused on its own; local flag not yet updated
    fake.shared.lock().unwrap().status.as_mut().unwrap().is_playing = false;
    assert!(core.snapshot().is_playing);
    let calls_before = fake.transport_calls().len();

    core.clear_queue().await;

    assert_eq!(
        fake.transport_calls()[calls_before..],
        [Call::Pause, Call::Unload]
    );
    assert!(!core.snapshot().is_playing);
}

#[tokio::test]
async fn test_run_loop_processes_commands_and_unloads_on_exit() {
    let (core, fake) = new_core();
    let state_manager = core.state_manager();
    let (event_tx, event_rx) = mpsc::channel(16);
    let handle = tokio::spawn(core.run(event_rx));

    event_tx
        .send(PlayerEvent::Command(Command::SetQueue {
            tracks: tracks(&["a", "b"]),
        }))
        .await
        .unwrap();
    event_tx
        .send(PlayerEvent::Command(Command::PlayAt { index: 1 }))
        .await
        .unwrap();
    event_tx.send(PlayerEvent::Shutdown).await.unwrap();
    handle.await.unwrap().unwrap();

    let state = state_manager.get_state().await;
    assert_eq!(state.current.map(|t| t.id).as_deref(), Some("b"));
    assert!(state.rev >= 3);
    assert_eq!(fake.loads(), vec![url("b")]);
    assert_eq!(fake.calls().last(), Some(&Call::Unload));
}
