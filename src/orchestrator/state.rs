use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::phase::PipelinePhase;

/// Durable pipeline state, one per project directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub phase: PipelinePhase,
    /// 0 when no epic is active.
    pub epic_number: u32,
    #[serde(default)]
    pub current_story: Option<String>,
    /// Human-readable resume marker; never used for transition logic.
    #[serde(default)]
    pub last_completed_step: Option<String>,
    #[serde(default)]
    pub scaffolding_complete: bool,
    /// HEAD commit when the current epic started; changes are measured from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    /// Equality ignoring the timestamp.
    pub fn same_position(&self, other: &PipelineState) -> bool {
        self.phase == other.phase
            && self.epic_number == other.epic_number
            && self.current_story == other.current_story
            && self.last_completed_step == other.last_completed_step
            && self.scaffolding_complete == other.scaffolding_complete
            && self.epic_base == other.epic_base
    }
}

/// Reads and writes the state file.
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_file: PathBuf,
}

impl StateStore {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    /// Absence of the file is the default IDLE state.
    pub fn load(&self) -> Result<PipelineState> {
        if !self.state_file.exists() {
            return Ok(PipelineState::default());
        }
        let content = fs::read_to_string(&self.state_file)
            .with_context(|| format!("Failed to read state file: {}", self.state_file.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.state_file.display()))
    }

    pub fn save(&self, state: &PipelineState) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let content = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, content + "\n").context("Failed to write state file")?;
        fs::rename(&tmp, &self.state_file).context("Failed to replace state file")?;
        Ok(())
    }
}
