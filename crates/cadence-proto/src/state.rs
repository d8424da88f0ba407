use crate::protocol::{EngineHealth, PlayerState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// The slice of state that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentState {
    pub volume: f32,
    #[serde(default = "default_autoplay")]
    pub autoplay: bool,
}

fn default_autoplay() -> bool {
    true
}

/// Published snapshot of the player.  The event loop is the only writer;
/// servers read it to answer clients.
pub struct StateManager {
    state: Arc<RwLock<PlayerState>>,
    state_file: PathBuf,
}

impl StateManager {
    /// `fallback` supplies volume and autoplay when no state file exists yet.
    pub fn new(state_file: PathBuf, fallback: PersistentState) -> Self {
        let persistent = Self::load_persistent(&state_file).unwrap_or(fallback);

        let state = PlayerState {
            rev: 1,
            volume: persistent.volume.clamp(0.0, 1.0),
            autoplay: persistent.autoplay,
            queue_visible: true,
            ..Default::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            state_file,
        }
    }

    pub fn arc(&self) -> Arc<RwLock<PlayerState>> {
        Arc::clone(&self.state)
    }

    pub async fn get_state(&self) -> PlayerState {
        self.state.read().await.clone()
    }

    pub async fn rev(&self) -> u64 {
        self.state.read().await.rev
    }

    /// Apply `f` and bump the revision.
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PlayerState),
    {
        let mut state = self.state.write().await;
        f(&mut state);
        state.rev += 1;
    }

    pub async fn set_timeline(&self, time_pos_secs: Option<f64>, duration_secs: Option<f64>) {
        self.update(|state| {
            state.time_pos_secs = time_pos_secs;
            state.duration_secs = duration_secs;
        })
        .await;
    }

    pub async fn set_engine_health(&self, health: EngineHealth) {
        self.update(|state| state.engine_health = health).await;
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.update(|state| state.volume = volume.clamp(0.0, 1.0))
            .await;
        self.save().await
    }

    pub async fn set_autoplay(&self, enabled: bool) -> anyhow::Result<()> {
        self.update(|state| state.autoplay = enabled).await;
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                volume: state.volume,
                autoplay: state.autoplay,
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> Option<PersistentState> {
        let content = std::fs::read_to_string(state_file).ok()?;
        match serde_json::from_str::<PersistentState>(&content) {
            Ok(persistent) => Some(persistent),
            Err(e) => {
                tracing::warn!("Ignoring unreadable state file {}: {}", state_file.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback() -> PersistentState {
        PersistentState {
            volume: 0.5,
            autoplay: true,
        }
    }

    #[tokio::test]
    async fn test_volume_and_autoplay_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let manager = StateManager::new(path.clone(), fallback());
        manager.set_volume(1.4).await.unwrap();
        manager.set_autoplay(false).await.unwrap();

        let reloaded = StateManager::new(path, fallback());
        let state = reloaded.get_state().await;
        assert_eq!(state.volume, 1.0);
        assert!(!state.autoplay);
    }

    #[tokio::test]
    async fn test_update_bumps_rev() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("s.json"), fallback());
        let before = manager.rev().await;
        manager.update(|s| s.searching = true).await;
        manager.set_timeline(Some(3.0), Some(10.0)).await;
        assert_eq!(manager.rev().await, before + 2);
        assert_eq!(manager.get_state().await.time_pos_secs, Some(3.0));
    }

    #[tokio::test]
    async fn test_corrupt_state_file_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let manager = StateManager::new(path, fallback());
        assert_eq!(manager.get_state().await.volume, 0.5);
    }
}
