//! Per-channel pipeline state.
//!
//! Each channel's run state lives in one JSON file under the state
//! directory, named by a slug of the channel so arbitrary channel names
//! stay filesystem-safe. Writes go through a temp file and rename so a
//! crash mid-write never leaves a truncated state file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Original channel name, not the slug; the slug only names the file.
    pub channel: String,
    pub run_id: String,
    pub steps: BTreeMap<String, StepStatus>,
    pub updated_at: String,
}

impl PipelineState {
    pub fn initialize(channel: &str, step_names: &[String]) -> Self {
        Self {
            channel: channel.to_string(),
            run_id: now_stamp(),
            steps: step_names
                .iter()
                .map(|name| (name.clone(), StepStatus::Pending))
                .collect(),
            updated_at: now_stamp(),
        }
    }

    pub fn mark_running(&mut self, step: &str) {
        self.set(step, StepStatus::Running);
    }

    pub fn mark_completed(&mut self, step: &str) {
        self.set(step, StepStatus::Completed);
    }

    pub fn mark_failed(&mut self, step: &str) {
        self.set(step, StepStatus::Failed);
    }

    fn set(&mut self, step: &str, status: StepStatus) {
        self.steps.insert(step.to_string(), status);
        self.updated_at = now_stamp();
    }

    /// Put interrupted work back to pending so a resumed run retries it.
    pub fn reset_incomplete(&mut self) {
        for status in self.steps.values_mut() {
            if matches!(status, StepStatus::Running | StepStatus::Failed) {
                *status = StepStatus::Pending;
            }
        }
        self.updated_at = now_stamp();
    }

    pub fn completed_steps(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|(_, status)| **status == StepStatus::Completed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn pending_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, status)| **status == StepStatus::Pending)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Filesystem-safe channel slug: lowercase, alphanumerics and `-`/`_`
/// kept, everything else becomes `-`, outer dashes trimmed. A name with
/// nothing left maps to `default`.
pub fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug
    }
}

pub struct PipelineStateStore {
    dir: PathBuf,
}

impl PipelineStateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path_for(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{}.json", slugify(channel)))
    }

    /// Load the channel's state; a missing file means no previous run. A
    /// corrupt file is treated the same way, with a warning, so one bad
    /// write never wedges the channel.
    pub fn load(&self, channel: &str) -> Option<PipelineState> {
        let path = self.path_for(channel);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<PipelineState>(&text) {
            Ok(mut state) => {
                // Distinct names can share a slug; the caller's name wins.
                state.channel = channel.to_string();
                debug!(channel, path = %path.display(), "Pipeline state loaded");
                Some(state)
            }
            Err(err) => {
                warn!(channel, path = %path.display(), error = %err, "Pipeline state malformed, starting fresh");
                None
            }
        }
    }

    /// Write-then-rename so readers never observe a partial file.
    pub fn save(&self, state: &PipelineState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating state dir {}", self.dir.display()))?;
        let path = self.path_for(&state.channel);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("writing state file {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming state file into {}", path.display()))?;
        Ok(())
    }

    pub fn clean(&self, channel: &str) -> Result<()> {
        let path = self.path_for(channel);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(channel, path = %path.display(), "Pipeline state removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<String> {
        ["fetch", "translate", "publish"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn slugify_rules() {
        assert_eq!(slugify("My Channel/Name"), "my-channel-name");
        assert_eq!(slugify("tech_news-42"), "tech_news-42");
        assert_eq!(slugify("///"), "default");
        assert_eq!(slugify(""), "default");
        assert_eq!(slugify("-edge-"), "edge");
    }

    #[test]
    fn initialize_marks_all_pending() {
        let state = PipelineState::initialize("news", &steps());
        assert_eq!(state.steps.len(), 3);
        assert!(state.steps.values().all(|s| *s == StepStatus::Pending));
        assert_eq!(state.pending_steps().len(), 3);
        assert!(state.completed_steps().is_empty());
        // run id and updated_at share the same UTC timestamp format
        assert!(state.run_id.contains('T') && state.run_id.ends_with('Z'));
        assert!(state.updated_at.contains('T') && state.updated_at.ends_with('Z'));
    }

    #[test]
    fn transitions_update_sets() {
        let mut state = PipelineState::initialize("news", &steps());
        state.mark_running("fetch");
        state.mark_completed("fetch");
        state.mark_running("translate");
        state.mark_failed("translate");

        assert!(state.completed_steps().contains("fetch"));
        assert_eq!(state.steps["translate"], StepStatus::Failed);

        state.reset_incomplete();
        assert_eq!(state.steps["translate"], StepStatus::Pending);
        // Completed work survives a reset.
        assert_eq!(state.steps["fetch"], StepStatus::Completed);
    }

    #[test]
    fn store_round_trip_preserves_channel_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStateStore::new(dir.path());
        let mut state = PipelineState::initialize("Channel/Name", &steps());
        state.mark_completed("fetch");
        store.save(&state).unwrap();

        assert!(dir.path().join("channel-name.json").is_file());
        let loaded = store.load("Channel/Name").unwrap();
        assert_eq!(loaded.channel, "Channel/Name");
        assert!(loaded.completed_steps().contains("fetch"));
    }

    #[test]
    fn load_reassociates_requested_channel_on_slug_collision() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStateStore::new(dir.path());
        store
            .save(&PipelineState::initialize("Channel/Name", &steps()))
            .unwrap();

        // "Channel Name" slugifies to the same file; the state must come
        // back under the name it was asked for, not the name on disk.
        let loaded = store.load("Channel Name").unwrap();
        assert_eq!(loaded.channel, "Channel Name");
    }

    #[test]
    fn load_missing_or_corrupt_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStateStore::new(dir.path());
        assert!(store.load("news").is_none());
        std::fs::write(store.path_for("news"), "{ nope").unwrap();
        assert!(store.load("news").is_none());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStateStore::new(dir.path());
        store
            .save(&PipelineState::initialize("news", &steps()))
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn clean_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStateStore::new(dir.path());
        store
            .save(&PipelineState::initialize("news", &steps()))
            .unwrap();
        store.clean("news").unwrap();
        assert!(store.load("news").is_none());
        store.clean("news").unwrap();
    }
}
