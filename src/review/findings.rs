//! Review findings produced by review agents.
//!
//! ## Types
//!
//! - [`Severity`]: totally ordered `critical > high > medium > low > info`
//! - [`ReviewFinding`]: a single reported defect
//! - [`AgentReport`]: the complete output of one agent run
//!
//! ## Example
//!
//! ```
//! use shipwright::review::findings::{ReviewFinding, Severity};
//!
//! let finding = ReviewFinding::new("Unchecked unwrap", Severity::High)
//!     .with_file("src/main.rs")
//!     .with_description("`config.unwrap()` panics on a missing file");
//!
//! assert!(finding.severity.at_least(Severity::Medium));
//! assert_eq!(finding.location(), "src/main.rs");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a finding.
///
/// Variants are declared from least to most severe so the derived `Ord`
/// gives `Critical > High > Medium > Low > Info`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Inclusive threshold check.
    ///
    /// ```
    /// use shipwright::review::findings::Severity;
    ///
    /// assert!(Severity::High.at_least(Severity::High));
    /// assert!(Severity::Critical.at_least(Severity::High));
    /// assert!(!Severity::Low.at_least(Severity::Medium));
    /// ```
    pub fn at_least(&self, threshold: Severity) -> bool {
        *self >= threshold
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Critical => "🔴",
            Self::High => "🟠",
            Self::Medium => "🟡",
            Self::Low => "🔵",
            Self::Info => "⚪",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "info" => Ok(Self::Info),
            _ => anyhow::bail!(
                "Invalid severity '{}'. Valid values: critical, high, medium, low, info",
                s
            ),
        }
    }
}

/// A single defect reported by a review agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub title: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Agent that reported the finding; filled in by the review loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl ReviewFinding {
    pub fn new(title: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            severity,
            file: None,
            description: String::new(),
            agent: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn location(&self) -> &str {
        self.file.as_deref().unwrap_or("(project)")
    }

    /// Title lowercased with whitespace collapsed, used to spot recurrences.
    pub fn normalized_title(&self) -> String {
        self.title
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ReviewFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} ({})",
            self.severity.emoji(),
            self.severity,
            self.title,
            self.location()
        )
    }
}

/// Output of one review agent run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent: String,
    pub success: bool,
    #[serde(default)]
    pub report: String,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
}

impl AgentReport {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn with_findings(mut self, findings: Vec<ReviewFinding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn failed(agent: impl Into<String>, report: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            success: false,
            report: report.into(),
            ..Default::default()
        }
    }
}

/// Split findings into (eligible for auto-fix, recorded only).
pub fn partition_by_severity(
    findings: &[ReviewFinding],
    min_fix_severity: Severity,
) -> (Vec<ReviewFinding>, Vec<ReviewFinding>) {
    findings
        .iter()
        .cloned()
        .partition(|f| f.severity.at_least(min_fix_severity))
}

/// Count findings per severity, most severe first, skipping zeros.
pub fn severity_histogram(findings: &[ReviewFinding]) -> Vec<(Severity, usize)> {
    [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ]
    .into_iter()
    .map(|s| (s, findings.iter().filter(|f| f.severity == s).count()))
    .filter(|(_, n)| *n > 0)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_total_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn severity_parse_and_serde() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!("urgent".parse::<Severity>().is_err());
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }

    #[test]
    fn partition_threshold_is_inclusive() {
        let findings = vec![
            ReviewFinding::new("a", Severity::Critical),
            ReviewFinding::new("b", Severity::Medium),
            ReviewFinding::new("c", Severity::Low),
            ReviewFinding::new("d", Severity::Info),
        ];
        let (eligible, deferred) = partition_by_severity(&findings, Severity::Medium);
        let eligible: Vec<_> = eligible.iter().map(|f| f.title.as_str()).collect();
        let deferred: Vec<_> = deferred.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(eligible, vec!["a", "b"]);
        assert_eq!(deferred, vec!["c", "d"]);
    }

    #[test]
    fn finding_deserializes_without_optional_fields() {
        let finding: ReviewFinding =
            serde_json::from_str(r#"{"title": "Missing test", "severity": "low"}"#).unwrap();
        assert_eq!(finding.severity, Severity::Low);
        assert!(finding.file.is_none());
        assert!(finding.description.is_empty());
    }

    #[test]
    fn normalized_title_collapses_case_and_space() {
        let f = ReviewFinding::new("  SQL   Injection in  Query ", Severity::High);
        assert_eq!(f.normalized_title(), "sql injection in query");
    }

    #[test]
    fn histogram_orders_most_severe_first() {
        let findings = vec![
            ReviewFinding::new("a", Severity::Low),
            ReviewFinding::new("b", Severity::Critical),
            ReviewFinding::new("c", Severity::Low),
        ];
        assert_eq!(
            severity_histogram(&findings),
            vec![(Severity::Critical, 1), (Severity::Low, 2)]
        );
    }
}
