//! Reaction queue: gift reactions wait here and play one at a time.

use std::collections::VecDeque;

use avatar_proto::protocol::ReactionEvent;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueState {
    #[default]
    Idle,
    Playing(ReactionEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// Added at `position` (0 = next to play).
    Queued { position: usize },
    /// An identical reaction is already waiting or playing.
    Duplicate,
}

/// What the display should do after a clip ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Reaction(ReactionEvent),
    /// Nothing left; go back to the resting clip.
    Rest,
}

#[derive(Debug, Default)]
pub struct ReactionQueue {
    pending: VecDeque<ReactionEvent>,
    state: QueueState,
}

impl ReactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reaction unless one with the same tag and repeat count is
    /// already pending or playing.  Bursts of the same gift collapse into
    /// one playback.
    pub fn enqueue(&mut self, event: ReactionEvent) -> Enqueued {
        let playing_same = matches!(&self.state, QueueState::Playing(p) if *p == event);
        if playing_same || self.pending.contains(&event) {
            return Enqueued::Duplicate;
        }
        self.pending.push_back(event);
        Enqueued::Queued {
            position: self.pending.len() - 1,
        }
    }

    /// Move to the next reaction, or to idle when the queue is drained.
    pub fn advance(&mut self) -> Next {
        match self.pending.pop_front() {
            Some(event) => {
                self.state = QueueState::Playing(event.clone());
                Next::Reaction(event)
            }
            None => {
                self.state = QueueState::Idle;
                Next::Rest
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state, QueueState::Playing(_))
    }

    pub fn playing(&self) -> Option<&ReactionEvent> {
        match &self.state {
            QueueState::Playing(event) => Some(event),
            QueueState::Idle => None,
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &ReactionEvent> {
        self.pending.iter()
    }

    /// Drop everything; used when a broadcast stops.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.state = QueueState::Idle;
    }
}
