/// Ordered play queue with an active-index pointer.
///
/// `current()` is a view of `tracks[active_index]`; it is `None` iff the
/// queue is empty or the index is past the end.  An empty queue always has
/// `active_index == 0`.
use deepcut_proto::protocol::Track;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Queue {
    tracks: Vec<Track>,
    active_index: usize,
}

/// What `remove` did relative to the active track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    OutOfBounds,
    BeforeActive,
    AfterActive,
    /// The active track was removed and `active_index` now points at the
    /// track that should play instead.
    ActiveReplaced,
    /// The active track was the only one.
    Emptied,
}

impl Queue {
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.active_index)
    }

    /// Replace the tracks.  The index is kept unless the new queue is empty.
    pub fn replace(&mut self, tracks: Vec<Track>) {
        self.tracks = tracks;
        if self.tracks.is_empty() {
            self.active_index = 0;
        }
    }

    /// Point at `index`.  Returns `false` (and changes nothing) when out of
    /// bounds.
    pub fn set_active(&mut self, index: usize) -> bool {
        if index >= self.tracks.len() {
            return false;
        }
        self.active_index = index;
        true
    }

    pub fn next_index(&self) -> Option<usize> {
        if self.tracks.is_empty() {
            return None;
        }
        let target = (self.active_index + 1).min(self.tracks.len() - 1);
        (target != self.active_index).then_some(target)
    }

    pub fn prev_index(&self) -> Option<usize> {
        if self.tracks.is_empty() {
            return None;
        }
        let target = self.active_index.saturating_sub(1);
        (target != self.active_index).then_some(target)
    }

    /// Insert right after the active track.
    pub fn insert_next(&mut self, track: Track) {
        let at = (self.active_index + 1).min(self.tracks.len());
        self.tracks.insert(at, track);
    }

    pub fn push(&mut self, track: Track) {
        self.tracks.push(track);
    }

    pub fn remove(&mut self, index: usize) -> Removal {
        if index >= self.tracks.len() {
            return Removal::OutOfBounds;
        }
        self.tracks.remove(index);

        if index < self.active_index {
            self.active_index -= 1;
            return Removal::BeforeActive;
        }
        if index > self.active_index {
            return Removal::AfterActive;
        }

        // The active track itself: successor slides into the same index,
        // otherwise fall back to the predecessor.
        if index < self.tracks.len() {
            Removal::ActiveReplaced
        } else if index > 0 {
            self.active_index = index - 1;
            Removal::ActiveReplaced
        } else {
            self.active_index = 0;
            Removal::Emptied
        }
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.active_index = 0;
    }
}
