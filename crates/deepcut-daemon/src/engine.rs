//! Playback engine contract.
//!
//! The player core drives exactly one `PlaybackEngine`.  An engine owns at
//! most one live session (one loaded resource).  Status updates for a session
//! travel through the `StatusSink` handed to `load`; each push carries the
//! generation it was created with plus a per-session sequence number so the
//! core can discard anything stale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Point-in-time view of the engine's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStatus {
    pub position_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
    pub is_loaded: bool,
}

/// One status notification from an engine session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPush {
    pub generation: u64,
    pub seq: u64,
    pub status: EngineStatus,
    /// The resource played to its end.  Sent at most once per session.
    pub finished: bool,
}

/// Per-session handle the engine uses to report status.
///
/// `finish` consumes the sink, so a session can signal completion only once
/// and cannot push anything after it.
#[derive(Debug)]
pub struct StatusSink {
    generation: u64,
    /// Highest sequence number handed out so far, readable by the core.
    issued: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<StatusPush>,
}

impl StatusSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<StatusPush>) -> Self {
        Self {
            generation,
            issued: Arc::new(AtomicU64::new(0)),
            tx,
        }
    }

    /// Shared view of the last sequence number sent.  Anything at or below
    /// it is already in flight when read.
    pub fn issued(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.issued)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the receiving side is gone.
    pub fn push(&mut self, status: EngineStatus) -> bool {
        self.send(status, false)
    }

    pub fn finish(mut self, status: EngineStatus) {
        self.send(status, true);
    }

    fn send(&mut self, status: EngineStatus, finished: bool) -> bool {
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .send(StatusPush {
                generation: self.generation,
                seq,
                status,
                finished,
            })
            .is_ok()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("playback engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("playback engine rejected load: {0}")]
    Rejected(String),
    #[error("cannot open {url}: {reason}")]
    Open { url: String, reason: String },
}

#[async_trait]
pub trait PlaybackEngine: Send {
    /// Release any current session, open `url`, start playing, and report
    /// status for the new session through `sink`.
    async fn load(&mut self, url: &str, sink: StatusSink) -> Result<(), LoadError>;

    /// No-op without a session.
    async fn pause(&mut self) -> anyhow::Result<()>;

    /// No-op without a session.
    async fn resume(&mut self) -> anyhow::Result<()>;

    /// No-op without a session.  Out-of-range positions are clamped by the
    /// engine.
    async fn seek(&mut self, ms: u64) -> anyhow::Result<()>;

    /// `None` when no session is open.
    async fn poll_status(&mut self) -> Option<EngineStatus>;

    /// Release the current session, if any.
    async fn unload(&mut self) -> anyhow::Result<()>;

    /// Final teardown when the daemon exits.
    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.unload().await
    }
}
