use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single framed message.  A full queue of a few thousand
/// tracks stays well below this.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    SetQueue { tracks: Vec<Track> },
    PlayAt { index: usize },
    Toggle,
    Next,
    Prev,
    Seek { ms: u64 },
    EnqueueNext { track: Track },
    EnqueueLast { track: Track },
    JumpTo { index: usize },
    RemoveAt { index: usize },
    ClearQueue,
    /// Pull a fresh status snapshot from the engine.
    Tick,
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: PlayerSnapshot,
    },
    State {
        data: PlayerSnapshot,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Immutable catalog entry with a resolved, ready-to-play stream locator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    pub stream_url: String,
}

/// Read-only view of the player published after every state change.
///
/// `current` mirrors `queue[active_index]` and is `None` iff the queue is
/// empty or the index points past its end.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlayerSnapshot {
    /// Monotonic revision counter, incremented on every publish.
    #[serde(default)]
    pub rev: u64,
    pub queue: Vec<Track>,
    pub active_index: usize,
    pub current: Option<Track>,
    pub is_playing: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    /// Most recent load failure, cleared by the next successful load.
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() > MAX_FRAME_LEN {
            anyhow::bail!("message too large: {} bytes", json.len());
        }
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`.  Returns `Ok(None)` when
    /// the buffer does not yet hold a complete frame.
    pub fn decode(data: &[u8]) -> anyhow::Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("frame length {} exceeds limit", len);
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok(Some((msg, 4 + len)))
    }
}
