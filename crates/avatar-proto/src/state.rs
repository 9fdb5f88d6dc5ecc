use crate::protocol::PanelState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;

/// What survives a daemon restart.  The room must still be re-confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistentState {
    pub last_persona_id: Option<String>,
    pub last_room_id: Option<String>,
}

/// Shared, read-mostly view of the panel state.
///
/// The core event loop is the only writer; socket and HTTP tasks read
/// snapshots from here.
pub struct StateManager {
    state: RwLock<PanelState>,
    state_file: PathBuf,
    persistent: RwLock<PersistentState>,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        let persistent = Self::load_persistent(&state_file);

        let state = PanelState {
            rev: 1,
            room_id: persistent.last_room_id.clone(),
            ..PanelState::default()
        };

        Self {
            state: RwLock::new(state),
            state_file,
            persistent: RwLock::new(persistent),
        }
    }

    pub async fn get_state(&self) -> PanelState {
        self.state.read().await.clone()
    }

    pub async fn persistent(&self) -> PersistentState {
        self.persistent.read().await.clone()
    }

    /// Replace the snapshot, keeping `rev` monotonic.  Returns the new rev.
    pub async fn publish(&self, mut next: PanelState) -> u64 {
        let mut state = self.state.write().await;
        next.rev = state.rev + 1;
        *state = next;
        state.rev
    }

    /// Remember the persona / room selection.  Writes only when something
    /// actually changed.
    pub async fn remember(
        &self,
        persona_id: Option<String>,
        room_id: Option<String>,
    ) -> anyhow::Result<()> {
        let next = PersistentState {
            last_persona_id: persona_id,
            last_room_id: room_id,
        };
        {
            let mut persistent = self.persistent.write().await;
            if *persistent == next {
                return Ok(());
            }
            *persistent = next;
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = self.persistent.read().await.clone();

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &PathBuf) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}
