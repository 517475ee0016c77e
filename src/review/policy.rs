//! Risk policy resolution.
//!
//! A risk policy is an ordered list of tiers, highest risk first. Each changed
//! file is assigned to the tier owning the most specific (longest) glob that
//! matches it; a file matching nothing falls into the last, lowest-risk tier.
//! The tier for a whole change set is the riskiest tier any file landed in.
//!
//! ```toml
//! [[tiers]]
//! name = "high"
//! patterns = ["src/auth/**", "**/*.sql"]
//! max_iterations = 5
//! min_fix_severity = "medium"
//! agents = ["code-quality", "test-coverage", "security"]
//! require_approval = true
//!
//! [[tiers]]
//! name = "low"
//! patterns = ["docs/**"]
//! max_iterations = 1
//! min_fix_severity = "high"
//! agents = ["code-quality"]
//! ```

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::review::findings::Severity;

/// Agents run when no policy file exists.
pub const DEFAULT_AGENTS: &[&str] = &["code-quality", "test-coverage", "security"];
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const DEFAULT_MIN_FIX_SEVERITY: Severity = Severity::High;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_min_fix_severity() -> Severity {
    DEFAULT_MIN_FIX_SEVERITY
}

fn default_agents() -> Vec<String> {
    DEFAULT_AGENTS.iter().map(|s| s.to_string()).collect()
}

/// One named risk bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskTier {
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_min_fix_severity")]
    pub min_fix_severity: Severity,
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,
    #[serde(default)]
    pub require_approval: bool,
}

impl RiskTier {
    /// Tier used when the project declares no policy ("no tiering").
    pub fn untiered(agents: Vec<String>, max_iterations: u32, min_fix_severity: Severity) -> Self {
        Self {
            name: "default".to_string(),
            patterns: Vec::new(),
            max_iterations: max_iterations.max(1),
            min_fix_severity,
            agents,
            require_approval: false,
        }
    }

    /// Longest pattern of this tier matching `file`.
    fn best_match(&self, file: &str) -> Option<&str> {
        self.patterns
            .iter()
            .filter(|p| {
                Pattern::new(p)
                    .map(|pat| pat.matches_with(file, MATCH_OPTIONS))
                    .unwrap_or(false)
            })
            .max_by_key(|p| p.chars().count())
            .map(|p| p.as_str())
    }
}

impl Default for RiskTier {
    fn default() -> Self {
        Self::untiered(
            default_agents(),
            DEFAULT_MAX_ITERATIONS,
            DEFAULT_MIN_FIX_SEVERITY,
        )
    }
}

/// Which tier a single file landed in, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAssignment {
    pub file: String,
    pub tier: String,
    /// `None` when the file fell through to the lowest tier.
    pub pattern: Option<String>,
}

/// Outcome of resolving a change set against a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTier {
    pub tier: RiskTier,
    pub assignments: Vec<FileAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RiskPolicy {
    #[serde(default)]
    pub tiers: Vec<RiskTier>,
}

impl RiskPolicy {
    pub fn parse(content: &str) -> Result<Self> {
        let policy: RiskPolicy = toml::from_str(content).context("Failed to parse risk policy")?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read risk policy: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid risk policy: {}", path.display()))
    }

    /// Absence of the policy file means "no tiering".
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        if path.exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            anyhow::bail!("risk policy declares no tiers");
        }
        let mut names = HashSet::new();
        for tier in &self.tiers {
            if !names.insert(tier.name.as_str()) {
                anyhow::bail!("duplicate tier name '{}'", tier.name);
            }
            if tier.max_iterations == 0 {
                anyhow::bail!("tier '{}' has max_iterations = 0", tier.name);
            }
            if tier.agents.is_empty() {
                anyhow::bail!("tier '{}' declares no agents", tier.name);
            }
            for pattern in &tier.patterns {
                Pattern::new(pattern).with_context(|| {
                    format!("tier '{}' has invalid glob '{}'", tier.name, pattern)
                })?;
            }
        }
        Ok(())
    }

    fn lowest(&self) -> (usize, &RiskTier) {
        let idx = self.tiers.len() - 1;
        (idx, &self.tiers[idx])
    }

    /// Assign one file to a tier, returning the tier index and matching pattern.
    fn assign(&self, file: &str) -> (usize, Option<&str>) {
        let mut best: Option<(usize, &str)> = None;
        for (idx, tier) in self.tiers.iter().enumerate() {
            if let Some(pattern) = tier.best_match(file) {
                let longer = best
                    .map(|(_, current)| pattern.chars().count() > current.chars().count())
                    .unwrap_or(true);
                if longer {
                    best = Some((idx, pattern));
                }
            }
        }
        match best {
            Some((idx, pattern)) => (idx, Some(pattern)),
            None => (self.lowest().0, None),
        }
    }

    /// The tier a single file belongs to.
    pub fn tier_for_file(&self, file: &str) -> &RiskTier {
        let (idx, _) = self.assign(&normalize_path(file));
        &self.tiers[idx]
    }

    /// Resolve a change set to the riskiest tier any of its files hits.
    pub fn resolve(&self, changed_files: &[String]) -> ResolvedTier {
        let mut riskiest = self.lowest().0;
        let mut assignments = Vec::with_capacity(changed_files.len());

        for file in changed_files {
            let file = normalize_path(file);
            let (idx, pattern) = self.assign(&file);
            riskiest = riskiest.min(idx);
            assignments.push(FileAssignment {
                tier: self.tiers[idx].name.clone(),
                pattern: pattern.map(str::to_string),
                file,
            });
        }

        ResolvedTier {
            tier: self.tiers[riskiest].clone(),
            assignments,
        }
    }
}

fn normalize_path(file: &str) -> String {
    let file = file.replace('\\', "/");
    file.strip_prefix("./").unwrap_or(&file).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"
[[tiers]]
name = "high"
patterns = ["src/auth/**", "**/*.sql"]
max_iterations = 5
min_fix_severity = "medium"
agents = ["code-quality", "test-coverage", "security"]
require_approval = true

[[tiers]]
name = "medium"
patterns = ["src/**"]
max_iterations = 3
min_fix_severity = "high"
agents = ["code-quality", "test-coverage"]

[[tiers]]
name = "low"
patterns = ["docs/**", "src/auth/README.md"]
max_iterations = 1
min_fix_severity = "critical"
agents = ["code-quality"]
"#;

    fn policy() -> RiskPolicy {
        RiskPolicy::parse(POLICY).unwrap()
    }

    #[test]
    fn parses_tiers_in_order() {
        let p = policy();
        let names: Vec<_> = p.tiers.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["high", "medium", "low"]);
        assert!(p.tiers[0].require_approval);
        assert!(!p.tiers[1].require_approval);
        assert_eq!(p.tiers[2].min_fix_severity, Severity::Critical);
    }

    #[test]
    fn longer_pattern_wins_across_tiers() {
        let p = policy();
        // "src/**" (medium) and "src/auth/**" (high) both match; the longer wins.
        assert_eq!(p.tier_for_file("src/auth/login.rs").name, "high");
        // "src/auth/README.md" (low) is longer than "src/auth/**" (high).
        assert_eq!(p.tier_for_file("src/auth/README.md").name, "low");
        assert_eq!(p.tier_for_file("src/lib.rs").name, "medium");
    }

    #[test]
    fn unmatched_file_falls_into_lowest_tier() {
        let p = policy();
        assert_eq!(p.tier_for_file("Cargo.toml").name, "low");
        let resolved = p.resolve(&["Cargo.toml".to_string()]);
        assert_eq!(resolved.tier.name, "low");
        assert!(resolved.assignments[0].pattern.is_none());
    }

    #[test]
    fn change_set_resolves_to_riskiest_file() {
        let p = policy();
        let resolved = p.resolve(&[
            "docs/guide.md".to_string(),
            "./src/util.rs".to_string(),
            "migrations/001_init.sql".to_string(),
        ]);
        assert_eq!(resolved.tier.name, "high");
        assert_eq!(resolved.assignments.len(), 3);
        assert_eq!(resolved.assignments[1].file, "src/util.rs");
        assert_eq!(resolved.assignments[1].tier, "medium");
        assert_eq!(
            resolved.assignments[2].pattern.as_deref(),
            Some("**/*.sql")
        );
    }

    #[test]
    fn empty_change_set_uses_lowest_tier() {
        let resolved = policy().resolve(&[]);
        assert_eq!(resolved.tier.name, "low");
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let p = RiskPolicy::parse(
            r#"
[[tiers]]
name = "top"
patterns = ["src/*.rs"]

[[tiers]]
name = "rest"
"#,
        )
        .unwrap();
        assert_eq!(p.tier_for_file("src/main.rs").name, "top");
        assert_eq!(p.tier_for_file("src/nested/mod.rs").name, "rest");
    }

    #[test]
    fn tier_defaults_fill_missing_fields() {
        let p = RiskPolicy::parse("[[tiers]]\nname = \"only\"\n").unwrap();
        let tier = &p.tiers[0];
        assert_eq!(tier.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(tier.min_fix_severity, DEFAULT_MIN_FIX_SEVERITY);
        assert_eq!(tier.agents.len(), DEFAULT_AGENTS.len());
        assert!(!tier.require_approval);
    }

    #[test]
    fn rejects_invalid_policies() {
        assert!(RiskPolicy::parse("").is_err());
        assert!(RiskPolicy::parse("[[tiers]]\nname = \"a\"\n[[tiers]]\nname = \"a\"\n").is_err());
        assert!(RiskPolicy::parse("[[tiers]]\nname = \"a\"\nmax_iterations = 0\n").is_err());
        assert!(RiskPolicy::parse("[[tiers]]\nname = \"a\"\npatterns = [\"[\"]\n").is_err());
    }

    #[test]
    fn missing_policy_file_means_no_tiering() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = RiskPolicy::load_optional(&dir.path().join("risk-policy.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn untiered_clamps_iterations() {
        let tier = RiskTier::untiered(vec!["security".into()], 0, Severity::Low);
        assert_eq!(tier.max_iterations, 1);
        assert_eq!(tier.name, "default");
    }
}
