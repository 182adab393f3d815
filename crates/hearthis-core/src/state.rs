use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::model::Scope;
use crate::queue::RepeatMode;

/// Session settings restored on the next start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub repeat: RepeatMode,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub last_scope: Option<Scope>,
}

fn default_volume() -> u8 {
    50
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            muted: false,
            repeat: RepeatMode::Off,
            shuffle: false,
            last_scope: None,
        }
    }
}

pub struct StateStore {
    state: PersistentState,
    state_file: PathBuf,
}

impl StateStore {
    /// Reads `state_file`; a missing or unreadable file yields `fallback`.
    pub fn open(state_file: PathBuf, fallback: PersistentState) -> Self {
        let state = Self::load_persistent(&state_file).unwrap_or(fallback);
        Self { state, state_file }
    }

    pub fn get(&self) -> &PersistentState {
        &self.state
    }

    /// Apply `change` and write the result if anything differs.
    pub async fn update(&mut self, change: impl FnOnce(&mut PersistentState)) -> anyhow::Result<()> {
        let before = self.state.clone();
        change(&mut self.state);
        if self.state == before {
            return Ok(());
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&self.state)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> Option<PersistentState> {
        let content = std::fs::read_to_string(state_file).ok()?;
        match serde_json::from_str::<PersistentState>(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("ignoring unreadable state file {}: {}", state_file.display(), e);
                None
            }
        }
    }
}
