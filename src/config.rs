use anyhow::{Context, Result};
use glob::glob;
use std::path::{Path, PathBuf};

use crate::pipeline_config::{CONFIG_FILE, ShipwrightToml};
use crate::review::adversarial::ReviewSettings;
use crate::review::agents::AgentCli;
use crate::review::policy::RiskPolicy;
use crate::review::rules::RuleStore;
use crate::sandbox::{CommandRunner, SandboxPolicy};

pub const SHIPWRIGHT_DIR: &str = ".shipwright";
const DEFAULT_POLICY_FILE: &str = "risk-policy.toml";

/// Runtime configuration for one project directory.
///
/// Bridges `shipwright.toml` with CLI overrides and knows where every
/// project-local file lives.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub shipwright_dir: PathBuf,
    pub toml: ShipwrightToml,
    pub autonomous: bool,
    pub verbose: bool,
    /// `--plan` override.
    pub plan_override: Option<PathBuf>,
}

impl Config {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let shipwright_dir = project_dir.join(SHIPWRIGHT_DIR);
        let toml = ShipwrightToml::load_or_default(&shipwright_dir)?;
        let autonomous = toml.pipeline.autonomous;

        Ok(Self {
            project_dir,
            shipwright_dir,
            toml,
            autonomous,
            verbose: false,
            plan_override: None,
        })
    }

    /// Apply CLI flags on top of file and environment values.
    pub fn with_cli_args(mut self, autonomous: bool, verbose: bool, plan: Option<PathBuf>) -> Self {
        self.autonomous = self.autonomous || autonomous;
        self.verbose = verbose;
        self.plan_override = plan;
        self
    }

    pub fn project_name(&self) -> String {
        self.toml.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.shipwright_dir.join(CONFIG_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.shipwright_dir.join("state.json")
    }

    pub fn reviews_dir(&self) -> PathBuf {
        self.shipwright_dir.join("reviews")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.shipwright_dir.join("inbox")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.shipwright_dir.join("logs")
    }

    pub fn deploy_record_file(&self) -> PathBuf {
        self.shipwright_dir.join(crate::deploy::DEPLOY_RECORD_FILE)
    }

    pub fn policy_file(&self) -> PathBuf {
        match &self.toml.review.policy_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.project_dir.join(path),
            None => self.shipwright_dir.join(DEFAULT_POLICY_FILE),
        }
    }

    /// The risk policy, or `None` when the project declares none.
    pub fn risk_policy(&self) -> Result<Option<RiskPolicy>> {
        RiskPolicy::load_optional(&self.policy_file())
    }

    pub fn rule_store(&self) -> Result<RuleStore> {
        match &self.toml.review.rules_file {
            Some(path) => Ok(RuleStore::new(expand_home(path))),
            None => RuleStore::global(),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.shipwright_dir, &self.reviews_dir(), &self.log_dir()] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn review_settings(&self) -> ReviewSettings {
        ReviewSettings {
            default_agents: self.toml.review.default_agents.clone(),
            default_max_iterations: self.toml.review.default_max_iterations,
            default_min_fix_severity: self.toml.review.min_fix_severity(),
            autonomous: self.autonomous,
        }
    }

    pub fn sandbox_policy(&self) -> SandboxPolicy {
        SandboxPolicy {
            project_dir: self.project_dir.clone(),
            allowed_programs: self.toml.sandbox.allowed_programs.clone(),
            denied_patterns: self.toml.sandbox.denied_patterns.clone(),
            allowed_dirs: self
                .toml
                .sandbox
                .allowed_dirs
                .iter()
                .map(|d| expand_home(d))
                .collect(),
        }
    }

    pub fn command_runner(&self) -> CommandRunner {
        CommandRunner::new(self.sandbox_policy(), self.toml.timeouts.to_timeouts())
    }

    pub fn agent_cli(&self) -> AgentCli {
        AgentCli {
            command: self.toml.agent_cmd(),
            model: self.toml.project.model.clone(),
            skip_permissions: self.toml.project.skip_permissions,
            runner: self.command_runner(),
        }
    }

    /// Find the planning document: `--plan`, then `[project].plan_file`, then
    /// `.shipwright/plan.md`, then the newest `docs/plans/*plan*.md`.
    pub fn find_plan_file(&self) -> Result<PathBuf> {
        let configured = self
            .plan_override
            .as_ref()
            .or(self.toml.project.plan_file.as_ref());
        if let Some(path) = configured {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                self.project_dir.join(path)
            };
            if !path.exists() {
                anyhow::bail!("Plan file not found: {}", path.display());
            }
            return Ok(path);
        }

        let preferred = self.shipwright_dir.join("plan.md");
        if preferred.exists() {
            return Ok(preferred);
        }

        let pattern = self.project_dir.join("docs/plans/*plan*.md");
        let pattern = pattern.to_string_lossy();
        let newest = glob(&pattern)
            .context("Invalid plan glob pattern")?
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((path, modified))
            })
            .max_by_key(|(_, modified)| *modified)
            .map(|(path, _)| path);

        newest.ok_or_else(|| {
            anyhow::anyhow!(
                "No plan file found. Pass --plan, set [project].plan_file, or create {}",
                preferred.display()
            )
        })
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
