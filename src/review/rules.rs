//! Durable review rules learned from recurring findings.
//!
//! The rule store spans projects (`~/.shipwright/review-rules.json` by default)
//! and is fed to review agents so future runs steer away from mistakes that
//! keep coming back.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::review::adversarial::IterationRecord;
use crate::review::findings::Severity;

pub const RULES_FILE: &str = "review-rules.json";

/// A recurring finding pattern worth remembering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRule {
    /// Normalized finding title.
    pub pattern: String,
    pub severity: Severity,
    pub occurrences: u32,
    #[serde(default)]
    pub agents: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_file: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ReviewRule {
    /// One-line form handed to agents.
    pub fn as_guidance(&self) -> String {
        format!(
            "[{}] avoid: {} (seen {} times)",
            self.severity, self.pattern, self.occurrences
        )
    }
}

/// Extract rule candidates from the iterations of one review loop.
///
/// A finding becomes a candidate when its normalized title shows up in two or
/// more iterations, or is reported by two or more agents.
pub fn extract_candidates(iterations: &[IterationRecord]) -> Vec<ReviewRule> {
    #[derive(Default)]
    struct Tally {
        iterations: BTreeSet<u32>,
        agents: BTreeSet<String>,
        severity: Severity,
        count: u32,
        example_file: Option<String>,
    }

    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
    for record in iterations {
        for finding in &record.findings {
            let key = finding.normalized_title();
            if key.is_empty() {
                continue;
            }
            let tally = tallies.entry(key).or_insert_with(|| Tally {
                severity: finding.severity,
                ..Default::default()
            });
            tally.iterations.insert(record.iteration);
            if let Some(agent) = &finding.agent {
                tally.agents.insert(agent.clone());
            }
            tally.severity = tally.severity.max(finding.severity);
            tally.count += 1;
            if tally.example_file.is_none() {
                tally.example_file = finding.file.clone();
            }
        }
    }

    let now = Utc::now();
    tallies
        .into_iter()
        .filter(|(_, t)| t.iterations.len() >= 2 || t.agents.len() >= 2)
        .map(|(pattern, t)| ReviewRule {
            pattern,
            severity: t.severity,
            occurrences: t.count,
            agents: t.agents,
            example_file: t.example_file,
            first_seen: now,
            last_seen: now,
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<ReviewRule>,
}

/// JSON-backed rule store.
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store under the global `~/.shipwright/` directory.
    pub fn global() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(Self::new(home.join(".shipwright").join(RULES_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<ReviewRule>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read rule store: {}", self.path.display()))?;
        let file: RuleFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse rule store: {}", self.path.display()))?;
        Ok(file.rules)
    }

    /// Merge candidates into the store; returns the number of new rules.
    pub fn merge(&self, candidates: &[ReviewRule]) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let mut rules = self.load()?;
        let mut added = 0;

        for candidate in candidates {
            match rules.iter_mut().find(|r| r.pattern == candidate.pattern) {
                Some(existing) => {
                    existing.occurrences += candidate.occurrences;
                    existing.severity = existing.severity.max(candidate.severity);
                    existing.agents.extend(candidate.agents.iter().cloned());
                    existing.last_seen = candidate.last_seen;
                    if existing.example_file.is_none() {
                        existing.example_file = candidate.example_file.clone();
                    }
                }
                None => {
                    rules.push(candidate.clone());
                    added += 1;
                }
            }
        }

        rules.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.occurrences.cmp(&a.occurrences))
                .then(a.pattern.cmp(&b.pattern))
        });

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&RuleFile { rules })
            .context("Failed to serialize rule store")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write rule store: {}", self.path.display()))?;
        Ok(added)
    }

    /// Top rules rendered as agent guidance.
    pub fn guidance(&self, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .load()?
            .iter()
            .take(limit)
            .map(ReviewRule::as_guidance)
            .collect())
    }
}
