//! Pipeline phases and the fixed transition table.
//!
//! The pipeline is a strict linear sequence with two permitted shortcuts:
//! `BRIDGING -> BUILDING` once project scaffolding is done, and
//! `SIGN_OFF -> RETROSPECTIVE` when no deployment target is configured.
//! `IDLE -> BRIDGING` re-enters the sequence for epics after the first.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of the delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelinePhase {
    #[default]
    Idle,
    Planning,
    Bridging,
    Scaffolding,
    Building,
    Reviewing,
    SignOff,
    Deploying,
    Retrospective,
    Complete,
}

impl PipelinePhase {
    /// All phases in canonical order.
    pub const ALL: [PipelinePhase; 10] = [
        PipelinePhase::Idle,
        PipelinePhase::Planning,
        PipelinePhase::Bridging,
        PipelinePhase::Scaffolding,
        PipelinePhase::Building,
        PipelinePhase::Reviewing,
        PipelinePhase::SignOff,
        PipelinePhase::Deploying,
        PipelinePhase::Retrospective,
        PipelinePhase::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Planning => "PLANNING",
            Self::Bridging => "BRIDGING",
            Self::Scaffolding => "SCAFFOLDING",
            Self::Building => "BUILDING",
            Self::Reviewing => "REVIEWING",
            Self::SignOff => "SIGN_OFF",
            Self::Deploying => "DEPLOYING",
            Self::Retrospective => "RETROSPECTIVE",
            Self::Complete => "COMPLETE",
        }
    }

    /// The canonical next phase, ignoring shortcuts.
    pub fn next(&self) -> Option<PipelinePhase> {
        match self {
            Self::Idle => Some(Self::Planning),
            Self::Planning => Some(Self::Bridging),
            Self::Bridging => Some(Self::Scaffolding),
            Self::Scaffolding => Some(Self::Building),
            Self::Building => Some(Self::Reviewing),
            Self::Reviewing => Some(Self::SignOff),
            Self::SignOff => Some(Self::Deploying),
            Self::Deploying => Some(Self::Retrospective),
            Self::Retrospective => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    /// Every phase reachable from `self` in one step.
    pub fn allowed_targets(&self) -> &'static [PipelinePhase] {
        match self {
            Self::Idle => &[Self::Planning, Self::Bridging],
            Self::Planning => &[Self::Bridging],
            Self::Bridging => &[Self::Scaffolding, Self::Building],
            Self::Scaffolding => &[Self::Building],
            Self::Building => &[Self::Reviewing],
            Self::Reviewing => &[Self::SignOff],
            Self::SignOff => &[Self::Deploying, Self::Retrospective],
            Self::Deploying => &[Self::Retrospective],
            Self::Retrospective => &[Self::Complete],
            Self::Complete => &[],
        }
    }

    /// Whether `(self, target)` is an edge of the transition table.
    pub fn can_transition_to(&self, target: PipelinePhase) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Leaving IDLE or PLANNING needs a loaded developer profile.
    pub fn requires_profile(&self) -> bool {
        matches!(self, Self::Idle | Self::Planning)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelinePhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| anyhow::anyhow!("Unknown pipeline phase '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_EDGES: &[(PipelinePhase, PipelinePhase)] = &[
        (PipelinePhase::Idle, PipelinePhase::Planning),
        (PipelinePhase::Idle, PipelinePhase::Bridging),
        (PipelinePhase::Planning, PipelinePhase::Bridging),
        (PipelinePhase::Bridging, PipelinePhase::Scaffolding),
        (PipelinePhase::Bridging, PipelinePhase::Building),
        (PipelinePhase::Scaffolding, PipelinePhase::Building),
        (PipelinePhase::Building, PipelinePhase::Reviewing),
        (PipelinePhase::Reviewing, PipelinePhase::SignOff),
        (PipelinePhase::SignOff, PipelinePhase::Deploying),
        (PipelinePhase::SignOff, PipelinePhase::Retrospective),
        (PipelinePhase::Deploying, PipelinePhase::Retrospective),
        (PipelinePhase::Retrospective, PipelinePhase::Complete),
    ];

    #[test]
    fn edge_table_matches_exactly() {
        for from in PipelinePhase::ALL {
            for to in PipelinePhase::ALL {
                let expected = VALID_EDGES.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "edge {} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn canonical_sequence_ends_at_complete() {
        let mut phase = PipelinePhase::Idle;
        let mut visited = vec![phase];
        while let Some(next) = phase.next() {
            assert!(phase.can_transition_to(next));
            phase = next;
            visited.push(phase);
        }
        assert_eq!(visited, PipelinePhase::ALL.to_vec());
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&PipelinePhase::SignOff).unwrap();
        assert_eq!(json, "\"SIGN_OFF\"");
        let parsed: PipelinePhase = serde_json::from_str("\"RETROSPECTIVE\"").unwrap();
        assert_eq!(parsed, PipelinePhase::Retrospective);
    }

    #[test]
    fn from_str_accepts_loose_spelling() {
        assert_eq!(
            "sign-off".parse::<PipelinePhase>().unwrap(),
            PipelinePhase::SignOff
        );
        assert_eq!(
            "building".parse::<PipelinePhase>().unwrap(),
            PipelinePhase::Building
        );
        assert!("shipping".parse::<PipelinePhase>().is_err());
    }

    #[test]
    fn only_idle_and_planning_require_profile() {
        let requiring: Vec<_> = PipelinePhase::ALL
            .iter()
            .filter(|p| p.requires_profile())
            .collect();
        assert_eq!(
            requiring,
            vec![&PipelinePhase::Idle, &PipelinePhase::Planning]
        );
    }
}
