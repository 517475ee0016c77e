//! The phase state machine.
//!
//! One [`Orchestrator`] owns the [`PipelineState`] for one project directory.
//! Every mutation is applied to a copy, persisted, and only then committed,
//! so a failed write or a rejected precondition leaves the state untouched.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use crate::errors::StateError;
use crate::orchestrator::state::{PipelineState, StateStore};
use crate::phase::PipelinePhase;
use crate::profile::DeveloperProfile;

pub struct Orchestrator {
    store: StateStore,
    state: PipelineState,
    profile: Option<DeveloperProfile>,
}

impl Orchestrator {
    /// Open the state for a project, creating defaults if none is stored.
    pub fn open(store: StateStore, profile: Option<DeveloperProfile>) -> Result<Self> {
        let state = store.load()?;
        debug!(
            phase = %state.phase,
            epic = state.epic_number,
            state_file = %store.path().display(),
            "Opened pipeline state"
        );
        Ok(Self {
            store,
            state,
            profile,
        })
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn phase(&self) -> PipelinePhase {
        self.state.phase
    }

    pub fn epic_number(&self) -> u32 {
        self.state.epic_number
    }

    pub fn profile(&self) -> Option<&DeveloperProfile> {
        self.profile.as_ref()
    }

    pub fn scaffolding_complete(&self) -> bool {
        self.state.scaffolding_complete
    }

    fn commit(&mut self, mut next: PipelineState) -> Result<(), StateError> {
        next.updated_at = Some(Utc::now());
        self.store
            .save(&next)
            .map_err(|source| StateError::Persist {
                path: self.store.path().to_path_buf(),
                source,
            })?;
        self.state = next;
        Ok(())
    }

    /// Check a transition without performing it.
    pub fn check_transition(&self, target: PipelinePhase) -> Result<(), StateError> {
        let from = self.state.phase;
        if !from.can_transition_to(target) {
            return Err(StateError::InvalidTransition { from, to: target });
        }
        if target == PipelinePhase::Scaffolding && self.state.scaffolding_complete {
            return Err(StateError::ScaffoldingAlreadyComplete);
        }
        if from == PipelinePhase::Bridging
            && target == PipelinePhase::Building
            && !self.state.scaffolding_complete
        {
            return Err(StateError::InvalidTransition { from, to: target });
        }
        if from.requires_profile() && self.profile.is_none() {
            return Err(StateError::ProfileRequired { from, to: target });
        }
        Ok(())
    }

    pub fn transition(&mut self, target: PipelinePhase) -> Result<(), StateError> {
        self.check_transition(target)?;
        let from = self.state.phase;
        let mut next = self.state.clone();
        next.phase = target;
        self.commit(next)?;
        info!(from = %from, to = %target, epic = self.state.epic_number, "Phase transition");
        Ok(())
    }

    /// Move to the canonical next phase, skipping SCAFFOLDING once it is done.
    pub fn advance(&mut self) -> Result<PipelinePhase, StateError> {
        let mut target = self.state.phase.next().ok_or(StateError::AlreadyComplete)?;
        if target == PipelinePhase::Scaffolding && self.state.scaffolding_complete {
            target = PipelinePhase::Building;
        }
        self.transition(target)?;
        Ok(target)
    }

    /// Begin epic `n` at IDLE, recording the commit its changes are measured
    /// from. Leaves the scaffolding flag alone.
    pub fn start_epic(&mut self, n: u32, base: Option<String>) -> Result<(), StateError> {
        let next = PipelineState {
            phase: PipelinePhase::Idle,
            epic_number: n,
            current_story: None,
            last_completed_step: None,
            epic_base: base,
            ..self.state.clone()
        };
        self.commit(next)?;
        info!(epic = n, base = ?self.state.epic_base, "Started epic");
        Ok(())
    }

    pub fn complete_scaffolding(&mut self) -> Result<(), StateError> {
        let mut next = self.state.clone();
        next.scaffolding_complete = true;
        self.commit(next)
    }

    pub fn set_current_story(&mut self, story: Option<String>) -> Result<(), StateError> {
        let mut next = self.state.clone();
        next.current_story = story;
        self.commit(next)
    }

    pub fn mark_step(&mut self, step: impl Into<String>) -> Result<(), StateError> {
        let mut next = self.state.clone();
        next.last_completed_step = Some(step.into());
        self.commit(next)
    }

    /// Back to the all-defaults state.
    pub fn reset(&mut self) -> Result<(), StateError> {
        self.commit(PipelineState::default())?;
        info!("Pipeline state reset");
        Ok(())
    }

    /// One-line description of where a resumed run picks up.
    pub fn resume_hint(&self) -> String {
        let s = &self.state;
        let mut hint = match s.phase {
            PipelinePhase::Complete => return "Pipeline is complete.".to_string(),
            PipelinePhase::Idle if s.epic_number == 0 => {
                return "No run in progress; `shipwright run` starts epic 1.".to_string();
            }
            phase => format!("Resuming epic {} at {}", s.epic_number, phase),
        };
        if let Some(story) = &s.current_story {
            hint.push_str(&format!(", story {}", story));
        }
        if let Some(step) = &s.last_completed_step {
            hint.push_str(&format!(" (last completed: {})", step));
        }
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Stack;
    use tempfile::{TempDir, tempdir};

    fn profile() -> DeveloperProfile {
        DeveloperProfile::new("ada", Stack::Rust)
    }

    fn open(dir: &TempDir, profile: Option<DeveloperProfile>) -> Orchestrator {
        let store = StateStore::new(dir.path().join(".shipwright").join("state.json"));
        Orchestrator::open(store, profile).unwrap()
    }

    /// Put the machine at `phase` by writing the state file directly.
    fn at(dir: &TempDir, phase: PipelinePhase, scaffolding_complete: bool) -> Orchestrator {
        let store = StateStore::new(dir.path().join(".shipwright").join("state.json"));
        store
            .save(&PipelineState {
                phase,
                epic_number: 1,
                scaffolding_complete,
                ..Default::default()
            })
            .unwrap();
        Orchestrator::open(store, Some(profile())).unwrap()
    }

    #[test]
    fn every_table_edge_succeeds() {
        for from in PipelinePhase::ALL {
            for &to in from.allowed_targets() {
                let dir = tempdir().unwrap();
                // Bridging -> Building needs scaffolding done; Scaffolding needs it not done.
                let scaffolded = to != PipelinePhase::Scaffolding;
                let mut orch = at(&dir, from, scaffolded);
                orch.transition(to)
                    .unwrap_or_else(|e| panic!("{} -> {} failed: {}", from, to, e));
                assert_eq!(orch.phase(), to);
            }
        }
    }

    #[test]
    fn every_other_pair_is_rejected_and_state_unchanged() {
        for from in PipelinePhase::ALL {
            for to in PipelinePhase::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                let dir = tempdir().unwrap();
                let mut orch = at(&dir, from, false);
                let err = orch.transition(to).unwrap_err();
                assert!(
                    matches!(err, StateError::InvalidTransition { from: f, to: t } if f == from && t == to),
                    "{} -> {} gave {:?}",
                    from,
                    to,
                    err
                );
                assert_eq!(orch.phase(), from);
                assert_eq!(open(&dir, None).phase(), from);
            }
        }
    }

    #[test]
    fn error_message_cites_both_phases() {
        let dir = tempdir().unwrap();
        let mut orch = at(&dir, PipelinePhase::Building, true);
        let msg = orch.transition(PipelinePhase::Complete).unwrap_err().to_string();
        assert!(msg.contains("BUILDING"));
        assert!(msg.contains("COMPLETE"));
    }

    #[test]
    fn profile_required_to_leave_idle_and_planning() {
        let dir = tempdir().unwrap();
        let mut orch = open(&dir, None);
        let err = orch.transition(PipelinePhase::Planning).unwrap_err();
        assert!(matches!(err, StateError::ProfileRequired { .. }));
        assert!(err.to_string().contains("developer profile"));
        assert_eq!(orch.phase(), PipelinePhase::Idle);
        assert!(!dir.path().join(".shipwright").join("state.json").exists());
    }

    #[test]
    fn bridging_to_building_requires_scaffolding() {
        let dir = tempdir().unwrap();
        let mut orch = at(&dir, PipelinePhase::Bridging, false);
        assert!(matches!(
            orch.transition(PipelinePhase::Building),
            Err(StateError::InvalidTransition { .. })
        ));
        orch.transition(PipelinePhase::Scaffolding).unwrap();
    }

    #[test]
    fn completed_scaffolding_cannot_be_reentered() {
        let dir = tempdir().unwrap();
        let mut orch = at(&dir, PipelinePhase::Bridging, false);
        orch.complete_scaffolding().unwrap();
        assert!(matches!(
            orch.transition(PipelinePhase::Scaffolding),
            Err(StateError::ScaffoldingAlreadyComplete)
        ));
        assert_eq!(orch.phase(), PipelinePhase::Bridging);
    }

    #[test]
    fn advance_skips_scaffolding_once_complete() {
        for from in PipelinePhase::ALL {
            if from == PipelinePhase::Complete || from == PipelinePhase::Scaffolding {
                continue;
            }
            let dir = tempdir().unwrap();
            let mut orch = at(&dir, from, true);
            let to = orch.advance().unwrap();
            assert_ne!(to, PipelinePhase::Scaffolding);
        }

        let dir = tempdir().unwrap();
        let mut orch = at(&dir, PipelinePhase::Bridging, true);
        assert_eq!(orch.advance().unwrap(), PipelinePhase::Building);

        let dir = tempdir().unwrap();
        let mut orch = at(&dir, PipelinePhase::Bridging, false);
        assert_eq!(orch.advance().unwrap(), PipelinePhase::Scaffolding);
    }

    #[test]
    fn advance_at_complete_fails() {
        let dir = tempdir().unwrap();
        let mut orch = at(&dir, PipelinePhase::Complete, true);
        assert!(matches!(orch.advance(), Err(StateError::AlreadyComplete)));
    }

    #[test]
    fn start_epic_clears_story_and_step_but_keeps_scaffolding() {
        let dir = tempdir().unwrap();
        let mut orch = at(&dir, PipelinePhase::SignOff, true);
        orch.set_current_story(Some("1.2".into())).unwrap();
        orch.mark_step("epic 1 approved").unwrap();

        orch.start_epic(2, Some("abc123".into())).unwrap();
        let s = orch.state();
        assert_eq!(s.phase, PipelinePhase::Idle);
        assert_eq!(s.epic_number, 2);
        assert!(s.current_story.is_none());
        assert!(s.last_completed_step.is_none());
        assert!(s.scaffolding_complete);
        assert_eq!(s.epic_base.as_deref(), Some("abc123"));
        assert_eq!(open(&dir, None).state().epic_base.as_deref(), Some("abc123"));
    }

    #[test]
    fn persist_reload_round_trip() {
        let dir = tempdir().unwrap();
        let mut orch = open(&dir, Some(profile()));
        orch.start_epic(1, None).unwrap();
        orch.transition(PipelinePhase::Planning).unwrap();
        orch.transition(PipelinePhase::Bridging).unwrap();
        orch.transition(PipelinePhase::Scaffolding).unwrap();
        orch.complete_scaffolding().unwrap();
        orch.advance().unwrap();
        orch.set_current_story(Some("1.1".into())).unwrap();

        let reopened = open(&dir, None);
        assert!(reopened.state().same_position(orch.state()));
        assert_eq!(reopened.phase(), PipelinePhase::Building);
        assert_eq!(reopened.epic_number(), 1);
        assert_eq!(reopened.state().current_story.as_deref(), Some("1.1"));
    }

    #[test]
    fn reset_restores_defaults() {
        let dir = tempdir().unwrap();
        let mut orch = at(&dir, PipelinePhase::Reviewing, true);
        orch.reset().unwrap();
        assert!(orch.state().same_position(&PipelineState::default()));
        assert!(open(&dir, None).state().same_position(&PipelineState::default()));
    }

    #[test]
    fn resume_hint_describes_position() {
        let dir = tempdir().unwrap();
        assert!(open(&dir, None).resume_hint().contains("starts epic 1"));

        let mut orch = at(&dir, PipelinePhase::Building, true);
        orch.set_current_story(Some("1.3".into())).unwrap();
        orch.mark_step("story 1.2 passed").unwrap();
        let hint = orch.resume_hint();
        assert!(hint.contains("epic 1 at BUILDING"));
        assert!(hint.contains("story 1.3"));
        assert!(hint.contains("story 1.2 passed"));
    }
}
