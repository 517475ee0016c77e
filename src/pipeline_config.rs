//! Pipeline configuration read from `.shipwright/shipwright.toml`.
//!
//! Every section is optional. Values are layered file → environment → CLI;
//! the CLI layer lives in [`crate::config::Config`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "storefront"
//! agent_cmd = "claude"
//! model = "sonnet"
//! plan_file = "docs/plan.md"
//!
//! [pipeline]
//! autonomous = false
//! approval_channel = "interactive"   # or "inbox"
//!
//! [review]
//! policy_file = ".shipwright/risk-policy.toml"
//! default_agents = ["code-quality", "test-coverage", "security"]
//! default_max_iterations = 3
//! default_min_fix_severity = "high"
//!
//! [commands]
//! test = "cargo test"
//! deploy = "./scripts/deploy.sh"
//!
//! [deploy]
//! target = "production"
//! provider = "shell"
//!
//! [timeouts]
//! status = 30
//! build = 1800
//! test = 900
//! deploy = 1200
//! agent = 600
//!
//! [sandbox]
//! allowed_programs = []
//! denied_patterns = ["rm -rf /", "git push --force"]
//! allowed_dirs = []
//!
//! [signoff]
//! max_rejection_cycles = 0
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gates::ApprovalChannel;
use crate::review::findings::Severity;
use crate::review::policy::{DEFAULT_AGENTS, DEFAULT_MAX_ITERATIONS, DEFAULT_MIN_FIX_SEVERITY};
use crate::sandbox::Timeouts;

pub const CONFIG_FILE: &str = "shipwright.toml";
pub const AGENT_CMD_ENV: &str = "SHIPWRIGHT_AGENT_CMD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Defaults to the project directory name.
    #[serde(default)]
    pub name: Option<String>,
    /// Agent CLI command (default: "claude").
    #[serde(default)]
    pub agent_cmd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Pass `--dangerously-skip-permissions` to the agent CLI.
    #[serde(default)]
    pub skip_permissions: bool,
    /// Planning document, relative to the project directory.
    #[serde(default)]
    pub plan_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub autonomous: bool,
    #[serde(default)]
    pub approval_channel: ApprovalChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    #[serde(default)]
    pub policy_file: Option<PathBuf>,
    #[serde(default = "default_agents")]
    pub default_agents: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    #[serde(default = "default_min_fix_severity")]
    pub default_min_fix_severity: String,
    /// Overrides `~/.shipwright/review-rules.json`.
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
}

fn default_agents() -> Vec<String> {
    DEFAULT_AGENTS.iter().map(|s| s.to_string()).collect()
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_min_fix_severity() -> String {
    DEFAULT_MIN_FIX_SEVERITY.to_string()
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            policy_file: None,
            default_agents: default_agents(),
            default_max_iterations: default_max_iterations(),
            default_min_fix_severity: default_min_fix_severity(),
            rules_file: None,
        }
    }
}

impl ReviewSection {
    /// Parsed minimum fix severity, falling back to the default when invalid.
    pub fn min_fix_severity(&self) -> Severity {
        self.default_min_fix_severity
            .parse()
            .unwrap_or(DEFAULT_MIN_FIX_SEVERITY)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsSection {
    /// Absent means tests pass trivially.
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub deploy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    /// Absent skips the deploy phase.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "shell".to_string()
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            target: None,
            provider: default_provider(),
        }
    }
}

/// Per-class command timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_status_timeout")]
    pub status: u64,
    #[serde(default = "default_build_timeout")]
    pub build: u64,
    #[serde(default = "default_test_timeout")]
    pub test: u64,
    #[serde(default = "default_deploy_timeout")]
    pub deploy: u64,
    #[serde(default = "default_agent_timeout")]
    pub agent: u64,
}

fn default_status_timeout() -> u64 {
    Timeouts::default().status.as_secs()
}

fn default_build_timeout() -> u64 {
    Timeouts::default().build.as_secs()
}

fn default_test_timeout() -> u64 {
    Timeouts::default().test.as_secs()
}

fn default_deploy_timeout() -> u64 {
    Timeouts::default().deploy.as_secs()
}

fn default_agent_timeout() -> u64 {
    Timeouts::default().agent.as_secs()
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            status: default_status_timeout(),
            build: default_build_timeout(),
            test: default_test_timeout(),
            deploy: default_deploy_timeout(),
            agent: default_agent_timeout(),
        }
    }
}

impl TimeoutsSection {
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            status: Duration::from_secs(self.status),
            build: Duration::from_secs(self.build),
            test: Duration::from_secs(self.test),
            deploy: Duration::from_secs(self.deploy),
            agent: Duration::from_secs(self.agent),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub allowed_programs: Vec<String>,
    #[serde(default = "default_denied_patterns")]
    pub denied_patterns: Vec<String>,
    #[serde(default)]
    pub allowed_dirs: Vec<PathBuf>,
}

fn default_denied_patterns() -> Vec<String> {
    ["rm -rf /", "git push --force", "mkfs", ":(){ :|:& };:"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            allowed_programs: Vec::new(),
            denied_patterns: default_denied_patterns(),
            allowed_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignoffSection {
    /// `0` means unbounded.
    #[serde(default)]
    pub max_rejection_cycles: u32,
}

/// The complete shipwright.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipwrightToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub signoff: SignoffSection,
}

impl ShipwrightToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shipwright.toml")
    }

    /// Load `.shipwright/shipwright.toml`, or defaults when it doesn't exist.
    pub fn load_or_default(shipwright_dir: &Path) -> Result<Self> {
        let path = shipwright_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize shipwright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent command (file → env → default).
    pub fn agent_cmd(&self) -> String {
        self.project
            .agent_cmd
            .clone()
            .or_else(|| std::env::var(AGENT_CMD_ENV).ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self
            .review
            .default_min_fix_severity
            .parse::<Severity>()
            .is_err()
        {
            warnings.push(format!(
                "Invalid review.default_min_fix_severity '{}': expected critical, high, medium, low or info",
                self.review.default_min_fix_severity
            ));
        }
        if self.review.default_max_iterations == 0 {
            warnings.push(
                "review.default_max_iterations is 0; the review loop will run once".to_string(),
            );
        }
        if self.review.default_agents.is_empty() {
            warnings.push("review.default_agents is empty; no review agents will run".to_string());
        }
        if self.deploy.target.is_some() && self.commands.deploy.is_none() {
            warnings.push(
                "deploy.target is set but commands.deploy is missing; deploy will be skipped"
                    .to_string(),
            );
        }

        let t = &self.timeouts;
        for (name, secs) in [
            ("status", t.status),
            ("build", t.build),
            ("test", t.test),
            ("deploy", t.deploy),
            ("agent", t.agent),
        ] {
            if secs == 0 {
                warnings.push(format!("timeouts.{} is 0; every {} command will time out", name, name));
            }
        }

        warnings
    }
}

/// Starter file written by `shipwright config init`.
pub fn default_template(project_name: &str) -> String {
    format!(
        r#"[project]
name = "{project_name}"
# agent_cmd = "claude"
# model = "sonnet"
# plan_file = "docs/plan.md"

[pipeline]
autonomous = false
approval_channel = "interactive"

[review]
default_agents = ["code-quality", "test-coverage", "security"]
default_max_iterations = 3
default_min_fix_severity = "high"
# policy_file = ".shipwright/risk-policy.toml"

[commands]
# test = "cargo test"
# deploy = "./scripts/deploy.sh"

[deploy]
# target = "production"
provider = "shell"

[timeouts]
status = 30
build = 1800
test = 900
deploy = 1200
agent = 600

[signoff]
max_rejection_cycles = 0
"#
    )
}
