//! Epic execution loop.
//!
//! Per epic: bridging, scaffolding (once per project), bounded build
//! iterations, the adversarial review loop and sign-off. After the last
//! epic: deploy (optional, never fatal) and retrospective.
//!
//! A delegate failure is caught at the phase boundary and turned into
//! [`RunOutcome::Halted`]; the state machine is left parked at the failing
//! phase so the next run resumes there. Precondition failures from the state
//! machine are returned as errors.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::deploy::DeployRecord;
use crate::errors::{PhaseFailure, StateError};
use crate::orchestrator::collaborators::{
    BuildOutcome, Collaborators, DeployOptions, Deployer, EpicBreakdown, MemoryEntry,
    PlanMetadata, RetrospectiveOptions, ReviewContext,
};
use crate::orchestrator::machine::Orchestrator;
use crate::phase::PipelinePhase;
use crate::review::adversarial::{
    AdversarialLoop, AdversarialLoopResult, ExitReason, ReviewSettings, review_record_path,
};
use crate::review::policy::RiskPolicy;
use crate::review::rules::RuleStore;
use crate::signoff::{SignOffDecision, SignOffProtocol};

/// Build iterations allowed per story.
const BUILD_ATTEMPTS_PER_STORY: usize = 3;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub project_dir: PathBuf,
    pub project_name: String,
    pub plan_file: PathBuf,
    pub model: Option<String>,
    pub review: ReviewSettings,
    /// Risk policy file, re-read at every review. `None` means untiered.
    pub policy_file: Option<PathBuf>,
    pub rules: Option<RuleStore>,
    pub reviews_dir: PathBuf,
    /// `None` skips the deploy phase.
    pub deploy: Option<DeployOptions>,
    pub deploy_record: PathBuf,
    /// 0 means unbounded.
    pub max_rejection_cycles: u32,
}

impl RunOptions {
    fn autonomous(&self) -> bool {
        self.review.autonomous
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Halted(PhaseFailure),
    AlreadyComplete,
}

/// Where the loop re-enters an epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpicEntry {
    Start,
    Scaffold,
    Build,
    Review,
    SignOff,
}

/// What a step produced: keep going, or stop with a failure.
type Step<T> = std::result::Result<T, PhaseFailure>;

pub struct Runner {
    orch: Orchestrator,
    collab: Collaborators,
    options: RunOptions,
}

impl Runner {
    pub fn new(orch: Orchestrator, collab: Collaborators, options: RunOptions) -> Self {
        Self {
            orch,
            collab,
            options,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orch
    }

    /// Run from wherever the persisted state says the pipeline is.
    ///
    /// The messaging listener is started first and always stopped, whatever
    /// the loop returns.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        if self.orch.phase() == PipelinePhase::Complete {
            info!("Pipeline already complete");
            return Ok(RunOutcome::AlreadyComplete);
        }

        let messaging = self.collab.messaging.clone();
        if let Some(adapter) = &messaging {
            adapter
                .start()
                .await
                .context("Failed to start messaging adapter")?;
            debug!("Messaging adapter started");
        }

        let outcome = self.run_epics().await;

        if let Some(adapter) = &messaging
            && let Err(e) = adapter.stop().await
        {
            warn!(error = %e, "Failed to stop messaging adapter");
        }
        outcome
    }

    async fn run_epics(&mut self) -> Result<RunOutcome> {
        let breakdown = match self.load_breakdown() {
            Ok(b) => b,
            Err(e) => {
                let phase = self.orch.phase();
                let epic = (self.orch.epic_number() > 0).then(|| self.orch.epic_number());
                return Ok(RunOutcome::Halted(self.failure(phase, epic, e)));
            }
        };
        let epic_count = breakdown.epics.len() as u32;
        info!(
            epics = epic_count,
            phase = %self.orch.phase(),
            epic = self.orch.epic_number(),
            "Starting pipeline run"
        );

        let phase = self.orch.phase();
        let current = self.orch.epic_number();
        let post_epic = matches!(
            phase,
            PipelinePhase::Deploying | PipelinePhase::Retrospective
        );

        if !post_epic {
            let (first, mut entry) = match (current, phase) {
                (0, _) => (1, EpicEntry::Start),
                (n, PipelinePhase::Scaffolding) => (n, EpicEntry::Scaffold),
                (n, PipelinePhase::Building) => (n, EpicEntry::Build),
                (n, PipelinePhase::Reviewing) => (n, EpicEntry::Review),
                (n, PipelinePhase::SignOff) => (n, EpicEntry::SignOff),
                (n, _) => (n, EpicEntry::Start),
            };
            if first > epic_count {
                anyhow::bail!(
                    "State refers to epic {} but the plan only has {} epic(s)",
                    first,
                    epic_count
                );
            }
            if first > 1 || entry != EpicEntry::Start {
                self.collab
                    .progress
                    .emit(phase, &self.orch.resume_hint());
            }

            for epic in first..=epic_count {
                if let Err(failure) = self.run_epic(&breakdown, epic, entry).await? {
                    return Ok(RunOutcome::Halted(failure));
                }
                entry = EpicEntry::Start;
            }
        } else {
            self.collab
                .progress
                .emit(phase, &self.orch.resume_hint());
        }

        if let Err(failure) = self.finish(epic_count).await? {
            return Ok(RunOutcome::Halted(failure));
        }
        Ok(RunOutcome::Completed)
    }

    fn load_breakdown(&self) -> Result<EpicBreakdown> {
        let text = std::fs::read_to_string(&self.options.plan_file).with_context(|| {
            format!(
                "Failed to read plan file: {}",
                self.options.plan_file.display()
            )
        })?;
        let breakdown = self.collab.bridge.parse(&text)?;
        if breakdown.epics.is_empty() {
            return Err(anyhow!(
                "Plan file {} contains no epics",
                self.options.plan_file.display()
            ));
        }
        Ok(breakdown)
    }

    /// Log a caught phase failure and report it.
    fn failure(&self, phase: PipelinePhase, epic: Option<u32>, err: anyhow::Error) -> PhaseFailure {
        let message = format!("{:#}", err);
        error!(phase = %phase, epic = ?epic, error = %message, "Phase failed");
        self.collab
            .progress
            .emit(phase, &format!("failed: {}", message));
        PhaseFailure::new(phase, epic, message)
    }

    fn enter(&mut self, target: PipelinePhase) -> Result<()> {
        self.orch.transition(target)?;
        self.collab.progress.emit(
            target,
            &format!("Epic {}: entering {}", self.orch.epic_number(), target),
        );
        Ok(())
    }

    async fn run_epic(
        &mut self,
        breakdown: &EpicBreakdown,
        epic: u32,
        entry: EpicEntry,
    ) -> Result<Step<()>> {
        let title = breakdown
            .epic(epic)
            .map(|e| e.title.clone())
            .unwrap_or_default();
        let story_count = breakdown.epic(epic).map(|e| e.stories.len()).unwrap_or(0);
        let plan_path = self
            .collab
            .bridge
            .plan_path(&self.options.project_dir, epic);

        let mut review: Option<AdversarialLoopResult> = None;

        if entry == EpicEntry::Start {
            let first_run = epic == 1 && !self.orch.scaffolding_complete();
            if self.orch.profile().is_none() {
                return Err(StateError::ProfileRequired {
                    from: PipelinePhase::Idle,
                    to: if first_run {
                        PipelinePhase::Planning
                    } else {
                        PipelinePhase::Bridging
                    },
                }
                .into());
            }
            let base = self.baseline();
            self.orch.start_epic(epic, base)?;
            info!(epic, title = %title, stories = story_count, "Starting epic");
            if first_run {
                self.enter(PipelinePhase::Planning)?;
                self.collab.progress.emit(
                    PipelinePhase::Planning,
                    &format!(
                        "Plan {} has {} epic(s)",
                        self.options.plan_file.display(),
                        breakdown.epics.len()
                    ),
                );
            }
            self.enter(PipelinePhase::Bridging)?;
            if let Err(e) = self.bridge(breakdown, epic) {
                return Ok(Err(self.failure(PipelinePhase::Bridging, Some(epic), e)));
            }
            self.orch.mark_step(format!("epic {} plan saved", epic))?;

            if self.orch.scaffolding_complete() {
                self.enter(PipelinePhase::Building)?;
            } else {
                self.enter(PipelinePhase::Scaffolding)?;
            }
        }

        if self.orch.phase() == PipelinePhase::Scaffolding {
            if self.orch.scaffolding_complete() {
                info!(epic, "Scaffolding already complete; not re-running it");
            } else {
                if let Err(e) = self.scaffold() {
                    return Ok(Err(self.failure(PipelinePhase::Scaffolding, Some(epic), e)));
                }
                self.orch.complete_scaffolding()?;
                self.orch.mark_step("scaffolding complete")?;
            }
            let next = self.orch.advance()?;
            self.collab
                .progress
                .emit(next, &format!("Epic {}: entering {}", epic, next));
        }

        if self.orch.phase() == PipelinePhase::Building {
            if !plan_path.exists() {
                // Resumed without the scoped plan on disk.
                if let Err(e) = self.bridge(breakdown, epic) {
                    return Ok(Err(self.failure(PipelinePhase::Building, Some(epic), e)));
                }
            }
            if let Err(failure) = self.build(epic, &plan_path, story_count).await? {
                return Ok(Err(failure));
            }
            self.enter(PipelinePhase::Reviewing)?;
        }

        if self.orch.phase() == PipelinePhase::Reviewing {
            match self.review(epic).await {
                Ok(result) => review = Some(result),
                Err(e) => return Ok(Err(self.failure(PipelinePhase::Reviewing, Some(epic), e))),
            }
            self.orch.mark_step(format!("epic {} review finished", epic))?;
            self.enter(PipelinePhase::SignOff)?;
        }

        if review.is_none() {
            review = self.reload_review(epic);
        }
        self.sign_off(epic, review.as_ref()).await
    }

    fn bridge(&self, breakdown: &EpicBreakdown, epic: u32) -> Result<PathBuf> {
        let metadata = PlanMetadata {
            project_name: self.options.project_name.clone(),
            epic_number: epic,
            profile: self.orch.profile().cloned(),
        };
        let plan = self.collab.bridge.convert(breakdown, &metadata)?;
        let path = self.collab.bridge.save(&plan, &self.options.project_dir)?;
        self.collab.progress.emit(
            PipelinePhase::Bridging,
            &format!(
                "Epic {} plan '{}' ({} stories) saved to {}",
                epic,
                plan.title,
                plan.story_count,
                path.display()
            ),
        );
        Ok(path)
    }

    /// Scaffold the project and write default files. A file that fails to
    /// write is a warning; existing files are left alone.
    fn scaffold(&self) -> Result<()> {
        let profile = self
            .orch
            .profile()
            .ok_or_else(|| anyhow!("No developer profile loaded"))?;
        let project_dir = &self.options.project_dir;
        let result = self.collab.scaffolder.scaffold(profile, project_dir)?;
        self.collab.progress.emit(
            PipelinePhase::Scaffolding,
            &format!(
                "Scaffolded {} director(ies), {} file(s) for {} stack",
                result.directories.len(),
                result.files.len(),
                profile.stack
            ),
        );

        let mut written = 0;
        for generator in &self.collab.default_files {
            for file in generator.generate(profile) {
                let path = project_dir.join(&file.filepath);
                if path.exists() {
                    debug!(path = %path.display(), "Default file exists, skipping");
                    continue;
                }
                match write_file(&path, &file.content) {
                    Ok(()) => written += 1,
                    Err(e) => {
                        warn!(
                            generator = generator.name(),
                            path = %path.display(),
                            error = %e,
                            "Failed to write default file"
                        );
                        self.collab.progress.warn(
                            PipelinePhase::Scaffolding,
                            &format!("could not write {}: {:#}", file.filepath.display(), e),
                        );
                    }
                }
            }
        }
        if written > 0 {
            self.collab.progress.emit(
                PipelinePhase::Scaffolding,
                &format!("Wrote {} default file(s)", written),
            );
        }
        Ok(())
    }

    async fn build(&mut self, epic: u32, plan_path: &Path, story_count: usize) -> Result<Step<()>> {
        let max_iterations = (BUILD_ATTEMPTS_PER_STORY * story_count).max(1);
        let model = self.options.model.clone();

        for iteration in 1..=max_iterations {
            debug!(epic, iteration, max_iterations, "Build iteration");
            let result = match self
                .collab
                .builder
                .run_one(&self.options.project_dir, plan_path, model.as_deref(), epic)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    return Ok(Err(self.failure(PipelinePhase::Building, Some(epic), e)));
                }
            };

            let story = result.story.clone().unwrap_or_else(|| "-".to_string());
            match result.outcome {
                BuildOutcome::Failed => {
                    let reason = result
                        .error
                        .unwrap_or_else(|| "build iteration failed".to_string());
                    return Ok(Err(self.failure(
                        PipelinePhase::Building,
                        Some(epic),
                        anyhow!("story {} failed: {}", story, reason),
                    )));
                }
                BuildOutcome::Passed => {
                    self.orch.set_current_story(result.story.clone())?;
                    self.orch.mark_step(format!("story {} passed", story))?;
                    self.collab
                        .progress
                        .emit(PipelinePhase::Building, &format!("Story {} passed", story));
                    if result.all_complete {
                        break;
                    }
                }
                BuildOutcome::AllComplete | BuildOutcome::NoStories => {
                    self.collab.progress.emit(
                        PipelinePhase::Building,
                        &format!("Epic {}: {:?}", epic, result.outcome),
                    );
                    break;
                }
            }
            if iteration == max_iterations {
                warn!(epic, max_iterations, "Build iteration budget exhausted");
                self.collab.progress.warn(
                    PipelinePhase::Building,
                    &format!(
                        "stopped after {} iteration(s) without all stories complete",
                        max_iterations
                    ),
                );
            }
        }
        self.orch.mark_step(format!("epic {} built", epic))?;
        Ok(Ok(()))
    }

    fn baseline(&self) -> Option<String> {
        self.collab.changes.baseline().unwrap_or_else(|e| {
            warn!(error = %e, "Could not record the epic's base commit");
            None
        })
    }

    fn changed_files(&self) -> Vec<String> {
        let since = self.orch.state().epic_base.as_deref();
        self.collab.changes.changed_files(since).unwrap_or_else(|e| {
            warn!(error = %e, "Could not list changed files");
            Vec::new()
        })
    }

    async fn review(&self, epic: u32) -> Result<AdversarialLoopResult> {
        let policy = match &self.options.policy_file {
            Some(path) => RiskPolicy::load_optional(path)?,
            None => None,
        };
        let mut review_loop = AdversarialLoop::new(
            self.collab.agents.clone(),
            self.collab.fixer.clone(),
            self.collab.tests.clone(),
            self.collab.gate.clone(),
            self.collab.progress.clone(),
            self.options.review.clone(),
        )
        .with_policy(policy)
        .with_reviews_dir(self.options.reviews_dir.clone());
        if let Some(rules) = &self.options.rules {
            review_loop = review_loop.with_rule_store(rules.clone());
        }
        let result = review_loop
            .run(&self.options.project_dir, epic, self.changed_files())
            .await?;
        if result.exit_reason == ExitReason::AgentFailure {
            let failed = result
                .iterations
                .last()
                .map(|r| r.agent_failures.join(", "))
                .unwrap_or_default();
            return Err(anyhow!("review agent(s) did not complete: {}", failed));
        }
        Ok(result)
    }

    fn reload_review(&self, epic: u32) -> Option<AdversarialLoopResult> {
        let path = review_record_path(&self.options.reviews_dir, epic);
        if !path.exists() {
            return None;
        }
        AdversarialLoopResult::load(&path)
            .map_err(|e| warn!(error = %e, "Could not reload review record"))
            .ok()
    }

    async fn sign_off(
        &mut self,
        epic: u32,
        review: Option<&AdversarialLoopResult>,
    ) -> Result<Step<()>> {
        let ctx = ReviewContext {
            project_dir: self.options.project_dir.clone(),
            epic_number: epic,
            changed_files: self.changed_files(),
            ..Default::default()
        };
        let protocol = SignOffProtocol::new(
            self.collab.gate.clone(),
            self.collab.agents.clone(),
            self.collab.fixer.clone(),
            self.collab.progress.clone(),
            self.options.autonomous(),
        )
        .with_max_rejection_cycles(self.options.max_rejection_cycles);

        let outcome = match protocol.run(&ctx, review).await {
            Ok(o) => o,
            Err(e) => return Ok(Err(self.failure(PipelinePhase::SignOff, Some(epic), e))),
        };
        if outcome.decision.is_approved() {
            self.orch.mark_step(format!(
                "epic {} approved after {} rejection(s)",
                epic, outcome.rejection_cycles
            ))?;
            return Ok(Ok(()));
        }

        let feedback = match outcome.decision {
            SignOffDecision::Reject { feedback } => feedback,
            SignOffDecision::Approve => String::new(),
        };
        Ok(Err(self.failure(
            PipelinePhase::SignOff,
            Some(epic),
            anyhow!("sign-off rejected: {}", feedback),
        )))
    }

    /// Deploy and retrospective, after every epic has been signed off.
    async fn finish(&mut self, epic_count: u32) -> Result<Step<()>> {
        let mut deploy_url = None;
        let deploy = match (&self.options.deploy, &self.collab.deployer) {
            (Some(options), Some(deployer)) => Some((options.clone(), deployer.clone())),
            (Some(_), None) => {
                warn!("Deploy target configured but no deployer available");
                None
            }
            _ => None,
        };

        if self.orch.phase() == PipelinePhase::SignOff {
            if deploy.is_some() {
                self.enter(PipelinePhase::Deploying)?;
            } else {
                self.enter(PipelinePhase::Retrospective)?;
            }
        }

        if self.orch.phase() == PipelinePhase::Deploying {
            if let Some((options, deployer)) = &deploy {
                deploy_url = self.deploy(options, deployer.as_ref()).await;
            }
            self.enter(PipelinePhase::Retrospective)?;
        }

        if let Err(e) = self.retrospective(epic_count, deploy_url).await {
            return Ok(Err(self.failure(PipelinePhase::Retrospective, None, e)));
        }
        self.enter(PipelinePhase::Complete)?;
        info!(epics = epic_count, "Pipeline complete");
        Ok(Ok(()))
    }

    /// Never fails the run. Returns the deployment URL on success.
    async fn deploy(
        &self,
        options: &DeployOptions,
        deployer: &dyn Deployer,
    ) -> Option<String> {
        let record = match deployer.deploy(options).await {
            Ok(result) => DeployRecord::from_result(&result),
            Err(e) => DeployRecord::from_error(&options.provider, &e),
        };
        if record.success {
            info!(provider = %record.provider, url = ?record.url, "Deploy succeeded");
            self.collab.progress.emit(
                PipelinePhase::Deploying,
                &format!(
                    "Deployed to {} via {}{}",
                    options.target,
                    record.provider,
                    record
                        .url
                        .as_deref()
                        .map(|u| format!(": {}", u))
                        .unwrap_or_default()
                ),
            );
        } else {
            let reason = record.error.clone().unwrap_or_else(|| "unknown error".into());
            warn!(provider = %record.provider, error = %reason, "Deploy failed");
            self.collab
                .progress
                .warn(PipelinePhase::Deploying, &format!("deploy failed: {}", reason));
        }
        if let Err(e) = record.save(&self.options.deploy_record) {
            warn!(error = %e, "Failed to save deploy record");
        }
        record.success.then_some(record.url).flatten()
    }

    async fn retrospective(&self, epic_count: u32, deploy_url: Option<String>) -> Result<()> {
        let retro = &self.collab.retrospective;
        let mut data = retro
            .analyze(&RetrospectiveOptions {
                project_dir: self.options.project_dir.clone(),
                epics_completed: epic_count,
            })
            .await?;
        if deploy_url.is_some() {
            data.deploy_url = deploy_url;
        }
        let report = retro.report(&data).await?;
        let now = Utc::now();
        let entries: Vec<MemoryEntry> = data
            .lessons
            .iter()
            .map(|lesson| MemoryEntry {
                kind: "lesson".to_string(),
                content: lesson.clone(),
                timestamp: now,
            })
            .collect();
        retro.save_memory(&entries).await?;
        self.collab.progress.emit(
            PipelinePhase::Retrospective,
            &format!(
                "Retrospective written to {} ({} lesson(s))",
                report.display(),
                entries.len()
            ),
        );
        Ok(())
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}
