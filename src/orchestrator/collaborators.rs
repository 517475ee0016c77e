//! Capability interfaces for everything the pipeline delegates.
//!
//! One trait per role. The runner receives concrete implementations through
//! [`Collaborators`], so tests substitute doubles without touching the
//! engine. Default implementations live in `crate::adapters`,
//! `crate::review::agents`, `crate::deploy` and `crate::gates`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::profile::DeveloperProfile;
use crate::review::findings::{AgentReport, ReviewFinding};
use crate::ui::ProgressSink;

pub use crate::gates::{ApprovalGate, GateDecision, MessagingAdapter};

// ── Bridging ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    /// e.g. "1.2"
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub stories: Vec<Story>,
    /// Raw markdown of the epic's story section.
    #[serde(default)]
    pub stories_markdown: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicBreakdown {
    pub epics: Vec<Epic>,
}

impl EpicBreakdown {
    /// Epic at a 1-based position.
    pub fn epic(&self, number: u32) -> Option<&Epic> {
        (number as usize)
            .checked_sub(1)
            .and_then(|idx| self.epics.get(idx))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanMetadata {
    pub project_name: String,
    pub epic_number: u32,
    pub profile: Option<DeveloperProfile>,
}

/// A plan document scoped to one epic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub epic_number: u32,
    pub title: String,
    pub story_count: usize,
    pub markdown: String,
}

pub trait Bridge: Send + Sync {
    fn parse(&self, plan_text: &str) -> Result<EpicBreakdown>;
    fn convert(&self, breakdown: &EpicBreakdown, metadata: &PlanMetadata) -> Result<Plan>;
    fn save(&self, plan: &Plan, project_dir: &Path) -> Result<PathBuf>;
    /// Where `save` puts the plan for an epic.
    fn plan_path(&self, project_dir: &Path, epic_number: u32) -> PathBuf;
}

// ── Scaffolding ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaffoldResult {
    pub directories: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    /// Relative to the project directory.
    pub filepath: PathBuf,
    pub content: String,
}

pub trait Scaffolder: Send + Sync {
    fn scaffold(&self, profile: &DeveloperProfile, project_dir: &Path) -> Result<ScaffoldResult>;
}

pub trait DefaultFileGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, profile: &DeveloperProfile) -> Vec<GeneratedFile>;
}

// ── Building ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildOutcome {
    Passed,
    Failed,
    NoStories,
    AllComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildIterationResult {
    pub outcome: BuildOutcome,
    pub story: Option<String>,
    pub error: Option<String>,
    pub all_complete: bool,
}

impl BuildIterationResult {
    pub fn new(outcome: BuildOutcome) -> Self {
        Self {
            outcome,
            story: None,
            error: None,
            all_complete: outcome == BuildOutcome::AllComplete,
        }
    }

    pub fn with_story(mut self, story: impl Into<String>) -> Self {
        self.story = Some(story.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[async_trait]
pub trait BuildIterator: Send + Sync {
    async fn run_one(
        &self,
        project_dir: &Path,
        plan_path: &Path,
        model: Option<&str>,
        epic_number: u32,
    ) -> Result<BuildIterationResult>;
}

// ── Review ──────────────────────────────────────────────────────────────

/// What a review or fix agent gets to see.
#[derive(Debug, Clone, Default)]
pub struct ReviewContext {
    pub project_dir: PathBuf,
    pub epic_number: u32,
    pub iteration: u32,
    pub changed_files: Vec<String>,
    /// Sign-off feedback the agent must address.
    pub feedback: Option<String>,
    /// Learned review rules, rendered as guidance lines.
    pub known_rules: Vec<String>,
}

#[async_trait]
pub trait ReviewAgent: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &ReviewContext) -> Result<AgentReport>;
}

pub trait AgentFactory: Send + Sync {
    fn create(&self, name: &str) -> Result<Arc<dyn ReviewAgent>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    Applied,
    Failed,
    /// Applied, then thrown out because the test suite failed.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixResult {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub status: FixStatus,
    #[serde(default)]
    pub detail: String,
}

impl FixResult {
    pub fn for_finding(finding: &ReviewFinding, status: FixStatus) -> Self {
        Self {
            title: finding.title.clone(),
            file: finding.file.clone(),
            status,
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Applies fixes for findings. Calls are serialized; fixes mutate the tree.
#[async_trait]
pub trait FixApplier: Send + Sync {
    async fn apply(&self, findings: &[ReviewFinding], ctx: &ReviewContext)
    -> Result<Vec<FixResult>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunResult {
    pub passed: bool,
    pub output: String,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self) -> Result<TestRunResult>;
}

pub trait ChangeTracker: Send + Sync {
    /// Marker for the current tree (a commit id), or `None` when there is
    /// nothing to anchor to.
    fn baseline(&self) -> Result<Option<String>>;

    /// Files changed since `since` (or since the current HEAD when `None`),
    /// relative to the project root.
    fn changed_files(&self, since: Option<&str>) -> Result<Vec<String>>;
}

// ── Deploy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub project_dir: PathBuf,
    pub target: String,
    pub provider: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployResult {
    pub success: bool,
    pub url: Option<String>,
    pub provider: String,
    pub error: Option<String>,
    pub output: String,
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, options: &DeployOptions) -> Result<DeployResult>;
}

// ── Retrospective ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetrospectiveOptions {
    pub project_dir: PathBuf,
    pub epics_completed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrospectiveData {
    pub epics_completed: u32,
    pub review_iterations: u32,
    pub total_findings: usize,
    pub total_fixed: usize,
    pub total_discarded: usize,
    pub unresolved: usize,
    /// Epics whose review loop stopped without converging.
    #[serde(default)]
    pub unconverged_epics: Vec<u32>,
    #[serde(default)]
    pub deploy_url: Option<String>,
    #[serde(default)]
    pub lessons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub kind: String,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait Retrospective: Send + Sync {
    async fn analyze(&self, options: &RetrospectiveOptions) -> Result<RetrospectiveData>;
    async fn report(&self, data: &RetrospectiveData) -> Result<PathBuf>;
    async fn save_memory(&self, entries: &[MemoryEntry]) -> Result<()>;
}

// ── Bundle ──────────────────────────────────────────────────────────────

/// Every collaborator the runner needs.
#[derive(Clone)]
pub struct Collaborators {
    pub bridge: Arc<dyn Bridge>,
    pub scaffolder: Arc<dyn Scaffolder>,
    pub default_files: Vec<Arc<dyn DefaultFileGenerator>>,
    pub builder: Arc<dyn BuildIterator>,
    pub agents: Arc<dyn AgentFactory>,
    pub fixer: Arc<dyn FixApplier>,
    pub tests: Arc<dyn TestRunner>,
    pub changes: Arc<dyn ChangeTracker>,
    /// `None` disables the deploy phase.
    pub deployer: Option<Arc<dyn Deployer>>,
    pub retrospective: Arc<dyn Retrospective>,
    pub gate: Arc<dyn ApprovalGate>,
    pub messaging: Option<Arc<dyn MessagingAdapter>>,
    pub progress: Arc<dyn ProgressSink>,
}
