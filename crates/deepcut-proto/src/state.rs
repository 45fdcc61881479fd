use crate::protocol::PlayerSnapshot;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, read-mostly store for the latest player snapshot.
///
/// Only the player core writes (via `publish`); socket and HTTP handlers read
/// with `get_state`.  Readers learn about new revisions from the daemon's
/// broadcast channel, not from here.
pub struct StateManager {
    state: Arc<RwLock<PlayerSnapshot>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(PlayerSnapshot::default())),
        }
    }

    pub async fn get_state(&self) -> PlayerSnapshot {
        self.state.read().await.clone()
    }

    /// Replace the stored snapshot.  The revision is assigned here so it
    /// stays monotonic no matter what the caller put in `snapshot.rev`.
    pub async fn publish(&self, mut snapshot: PlayerSnapshot) -> u64 {
        let mut state = self.state.write().await;
        snapshot.rev = state.rev + 1;
        *state = snapshot;
        state.rev
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
