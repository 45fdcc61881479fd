/// PlayerCore: single-owner event loop for the queue and transport state.
///
/// Everything that wants to change playback sends a `PlayerEvent` to this
/// loop.  PlayerCore owns the `Queue`, the transport fields and the
/// `PlaybackEngine` exclusively; no other task touches them.
///
/// Engine status arrives on a separate channel as `StatusPush` values.  Each
/// load gets a fresh generation id, and each push carries the generation it
/// belongs to plus a per-session sequence number.  Pushes for an old
/// generation, or with a sequence number we have already passed, are
/// dropped.  Polls and seeks also count in that order: each raises the
/// applied sequence to whatever the session had issued by then, so a push
/// still queued from before cannot move the position back.  A `finished`
/// push advances the queue from inside the loop even when its status is
/// already outdated.
///
/// After each change PlayerCore publishes a new snapshot through the
/// `StateManager` and broadcasts `BroadcastMessage::StateUpdated`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use deepcut_proto::protocol::{Command, PlayerSnapshot, Track};
use deepcut_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::{EngineStatus, PlaybackEngine, StatusPush, StatusSink};
use crate::queue::{Queue, Removal};
use crate::BroadcastMessage;

#[cfg(test)]
mod tests;

// ── PlayerEvent ───────────────────────────────────────────────────────────────

/// All inputs into the PlayerCore loop.
#[derive(Debug)]
pub enum PlayerEvent {
    /// A command from a socket client or the HTTP API.
    Command(Command),
    /// Shutdown requested.
    Shutdown,
}

// ── PlayerCore ────────────────────────────────────────────────────────────────

pub struct PlayerCore<E: PlaybackEngine> {
    engine: E,
    queue: Queue,
    is_playing: bool,
    position_ms: u64,
    duration_ms: u64,
    last_error: Option<String>,
    /// Id of the session whose pushes we accept.
    generation: u64,
    /// Highest sequence number applied for `generation`.
    last_seq: u64,
    /// Last sequence number issued by the current session's sink.
    issued: Arc<AtomicU64>,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    status_tx: mpsc::UnboundedSender<StatusPush>,
    status_rx: mpsc::UnboundedReceiver<StatusPush>,
    /// Periodic engine poll.  `None` disables the ticker.
    tick_interval: Option<Duration>,
}

impl<E: PlaybackEngine> PlayerCore<E> {
    pub fn new(
        engine: E,
        state_manager: Arc<StateManager>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        tick_interval_ms: u64,
    ) -> Self {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            queue: Queue::default(),
            is_playing: false,
            position_ms: 0,
            duration_ms: 0,
            last_error: None,
            generation: 0,
            last_seq: 0,
            issued: Arc::new(AtomicU64::new(0)),
            state_manager,
            broadcast_tx,
            status_tx,
            status_rx,
            tick_interval: (tick_interval_ms > 0).then(|| Duration::from_millis(tick_interval_ms)),
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            rev: 0,
            queue: self.queue.tracks().to_vec(),
            active_index: self.queue.active_index(),
            current: self.queue.current().cloned(),
            is_playing: self.is_playing,
            position_ms: self.position_ms,
            duration_ms: self.duration_ms,
            last_error: self.last_error.clone(),
        }
    }

    /// Run the event loop.  Returns when a `Shutdown` event is received or
    /// the event channel is closed.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<PlayerEvent>) -> anyhow::Result<()> {
        info!("PlayerCore: starting event loop");
        self.publish().await;

        let period = self.tick_interval.unwrap_or(Duration::from_secs(1));
        let tick_enabled = self.tick_interval.is_some();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("PlayerCore: event channel closed, shutting down");
                        break;
                    }
                    Some(PlayerEvent::Shutdown) => {
                        info!("PlayerCore: shutdown requested");
                        break;
                    }
                    Some(PlayerEvent::Command(cmd)) => self.handle_command(cmd).await,
                },
                Some(push) = self.status_rx.recv() => self.handle_status(push).await,
                _ = ticker.tick(), if tick_enabled => self.tick().await,
            }
        }

        self.cleanup().await;
        Ok(())
    }

    pub async fn handle_command(&mut self, cmd: Command) {
        match &cmd {
            Command::SetQueue { tracks } => {
                info!("PlayerCore: command SetQueue ({} tracks)", tracks.len())
            }
            Command::Tick | Command::GetState => debug!("PlayerCore: command {:?}", cmd),
            other => info!("PlayerCore: command {:?}", other),
        }
        match cmd {
            Command::SetQueue { tracks } => self.set_queue(tracks).await,
            Command::PlayAt { index } => self.play_at(index).await,
            Command::Toggle => self.toggle().await,
            Command::Next => self.next().await,
            Command::Prev => self.prev().await,
            Command::Seek { ms } => self.seek(ms).await,
            Command::EnqueueNext { track } => self.enqueue_next(track).await,
            Command::EnqueueLast { track } => self.enqueue_last(track).await,
            Command::JumpTo { index } => self.jump_to(index).await,
            Command::RemoveAt { index } => self.remove_at(index).await,
            Command::ClearQueue => self.clear_queue().await,
            Command::Tick => self.tick().await,
            Command::GetState => {
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
        }
    }

    // ── status pushes ─────────────────────────────────────────────────────────

    pub async fn handle_status(&mut self, push: StatusPush) {
        if push.generation != self.generation {
            debug!(
                "PlayerCore: dropping push of generation {} (current {})",
                push.generation, self.generation
            );
            return;
        }
        if push.seq <= self.last_seq {
            debug!(
                "PlayerCore: dropping out-of-order push seq={} (last {})",
                push.seq, self.last_seq
            );
            if !push.finished {
                return;
            }
            // the session ended regardless of what was applied since
            self.is_playing = false;
            self.publish().await;
        } else {
            self.last_seq = push.seq;
            self.fold(push.status);
            self.publish().await;
        }

        if push.finished {
            info!("PlayerCore: track finished, advancing");
            self.next().await;
        }
    }

    /// Apply every status push already waiting in the channel.
    #[cfg(test)]
    pub async fn pump_status(&mut self) {
        while let Ok(push) = self.status_rx.try_recv() {
            self.handle_status(push).await;
        }
    }

    fn fold(&mut self, status: EngineStatus) {
        self.position_ms = status.position_ms;
        self.duration_ms = status.duration_ms;
        self.is_playing = status.is_playing;
    }

    // ── queue operations ──────────────────────────────────────────────────────

    pub async fn set_queue(&mut self, tracks: Vec<Track>) {
        self.queue.replace(tracks);
        self.publish().await;
    }

    pub async fn play_at(&mut self, index: usize) {
        if !self.queue.set_active(index) {
            debug!("PlayerCore: play_at({}) out of bounds", index);
            return;
        }
        let Some(track) = self.queue.current().cloned() else {
            return;
        };

        self.is_playing = true;
        self.position_ms = 0;
        self.duration_ms = 0;
        self.publish().await;

        self.generation += 1;
        self.last_seq = 0;
        let sink = StatusSink::new(self.generation, self.status_tx.clone());
        self.issued = sink.issued();

        info!("PlayerCore: loading '{}' by {} ({})", track.title, track.artist, track.id);
        match self.engine.load(&track.stream_url, sink).await {
            Ok(()) => {
                if self.last_error.take().is_some() {
                    self.publish().await;
                }
            }
            Err(e) => {
                warn!("PlayerCore: load failed for {}: {}", track.id, e);
                self.is_playing = false;
                self.last_error = Some(e.to_string());
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::Notice(format!("Cannot play '{}': {}", track.title, e)));
                self.publish().await;
            }
        }
    }

    pub async fn toggle(&mut self) {
        let playing = match self.engine.poll_status().await {
            None => {
                self.is_playing = false;
                self.publish().await;
                return;
            }
            Some(status) if status.is_loaded => status.is_playing,
            Some(_) => self.is_playing,
        };

        if playing {
            if let Err(e) = self.engine.pause().await {
                warn!("PlayerCore: pause failed: {}", e);
            }
            self.is_playing = false;
        } else {
            if let Err(e) = self.engine.resume().await {
                warn!("PlayerCore: resume failed: {}", e);
            }
            self.is_playing = true;
        }
        self.publish().await;
    }

    pub async fn next(&mut self) {
        if let Some(index) = self.queue.next_index() {
            self.play_at(index).await;
        }
    }

    pub async fn prev(&mut self) {
        if let Some(index) = self.queue.prev_index() {
            self.play_at(index).await;
        }
    }

    pub async fn seek(&mut self, ms: u64) {
        if let Err(e) = self.engine.seek(ms).await {
            warn!("PlayerCore: seek failed: {}", e);
        }
        if self.queue.current().is_some() {
            self.supersede_pending(self.issued.load(Ordering::SeqCst));
            self.position_ms = ms;
            self.publish().await;
        }
    }

    pub async fn tick(&mut self) {
        // read before polling: pushes issued later may be newer than the poll
        let issued = self.issued.load(Ordering::SeqCst);
        let Some(status) = self.engine.poll_status().await else {
            return;
        };
        if !status.is_loaded {
            return;
        }
        self.supersede_pending(issued);
        let before = (self.position_ms, self.duration_ms, self.is_playing);
        self.fold(status);
        if before != (self.position_ms, self.duration_ms, self.is_playing) {
            self.publish().await;
        }
    }

    pub async fn enqueue_next(&mut self, track: Track) {
        if self.queue.current().is_none() {
            self.start_fresh(track).await;
            return;
        }
        self.queue.insert_next(track);
        self.publish().await;
    }

    pub async fn enqueue_last(&mut self, track: Track) {
        if self.queue.current().is_none() {
            self.start_fresh(track).await;
            return;
        }
        self.queue.push(track);
        self.publish().await;
    }

    pub async fn jump_to(&mut self, index: usize) {
        if index < self.queue.len() {
            self.play_at(index).await;
        }
    }

    pub async fn remove_at(&mut self, index: usize) {
        match self.queue.remove(index) {
            Removal::OutOfBounds => {}
            Removal::BeforeActive | Removal::AfterActive => self.publish().await,
            Removal::ActiveReplaced => {
                let index = self.queue.active_index();
                self.play_at(index).await;
            }
            Removal::Emptied => {
                self.release_session().await;
                self.reset_transport();
                self.publish().await;
            }
        }
    }

    pub async fn clear_queue(&mut self) {
        if self.is_playing {
            if let Err(e) = self.engine.pause().await {
                warn!("PlayerCore: pause failed: {}", e);
            }
        }
        self.release_session().await;
        self.queue.clear();
        self.reset_transport();
        self.publish().await;
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    async fn start_fresh(&mut self, track: Track) {
        self.queue.replace(vec![track]);
        self.play_at(0).await;
    }

    /// Treat every push issued up to `seq` as older than the state about to
    /// be written.
    fn supersede_pending(&mut self, seq: u64) {
        self.last_seq = self.last_seq.max(seq);
    }

    /// Unload the engine session and stop accepting its pushes.
    async fn release_session(&mut self) {
        self.generation += 1;
        self.last_seq = 0;
        self.issued = Arc::new(AtomicU64::new(0));
        if let Err(e) = self.engine.unload().await {
            warn!("PlayerCore: unload failed: {}", e);
        }
    }

    fn reset_transport(&mut self) {
        self.is_playing = false;
        self.position_ms = 0;
        self.duration_ms = 0;
    }

    async fn publish(&mut self) {
        let rev = self.state_manager.publish(self.snapshot()).await;
        debug!("PlayerCore: published rev {}", rev);
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn cleanup(&mut self) {
        self.generation += 1;
        if let Err(e) = self.engine.shutdown().await {
            warn!("PlayerCore: engine shutdown failed: {}", e);
        }
        info!("PlayerCore: stopped");
    }
}
