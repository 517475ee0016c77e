//! Adversarial review convergence loop.
//!
//! Each iteration fans the tier's agents out over the same snapshot, keeps
//! the findings at or above the tier's minimum fix severity, optionally asks
//! the approval gate, applies fixes one batch at a time and re-runs the test
//! suite. The loop stops when an iteration produces nothing fix-eligible
//! (`converged`), when the gate says no (`rejected`) or when the tier's
//! iteration budget runs out (`max-iterations`). A quiet iteration in which
//! an agent failed to report is not convergence; it stops with
//! `agent-failure`.
//!
//! Discarded fixes are accounted for but not reverted on disk; the next
//! iteration's agents see the tree as the fixer left it.

use anyhow::{Context, Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::orchestrator::collaborators::{
    AgentFactory, ApprovalGate, FixApplier, FixResult, FixStatus, GateDecision, ReviewContext,
    TestRunner,
};
use crate::phase::PipelinePhase;
use crate::review::findings::{ReviewFinding, Severity, partition_by_severity, severity_histogram};
use crate::review::policy::{RiskPolicy, RiskTier};
use crate::review::rules::{RuleStore, extract_candidates};
use crate::ui::ProgressSink;

/// How many learned rules are handed to agents.
const RULE_GUIDANCE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    Converged,
    MaxIterations,
    Rejected,
    AgentFailure,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExitReason::Converged => "converged",
            ExitReason::MaxIterations => "max-iterations",
            ExitReason::Rejected => "rejected",
            ExitReason::AgentFailure => "agent-failure",
        })
    }
}

/// What happened in one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    pub findings: Vec<ReviewFinding>,
    pub eligible: usize,
    pub deferred: usize,
    /// Agents that reported `success = false`.
    #[serde(default)]
    pub agent_failures: Vec<String>,
    #[serde(default)]
    pub gate_approved: Option<bool>,
    #[serde(default)]
    pub fix_results: Vec<FixResult>,
    #[serde(default)]
    pub tests_passed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdversarialLoopResult {
    pub tier: String,
    pub iterations: Vec<IterationRecord>,
    pub converged: bool,
    pub exit_reason: ExitReason,
    pub total_findings: usize,
    pub total_fixed: usize,
    pub total_discarded: usize,
    pub unresolved_findings: Vec<ReviewFinding>,
    pub all_fix_results: Vec<FixResult>,
}

impl AdversarialLoopResult {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read review record: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse review record: {}", path.display()))
    }

    /// Markdown summary of every iteration.
    pub fn summary_markdown(&self, epic_number: u32) -> String {
        let mut out = format!("# Review: epic {}\n\n", epic_number);
        out.push_str(&format!("- Tier: {}\n", self.tier));
        out.push_str(&format!(
            "- Outcome: {} after {} iteration(s)\n",
            self.exit_reason,
            self.iterations.len()
        ));
        out.push_str(&format!(
            "- Findings: {} total, {} fixed, {} discarded, {} unresolved\n",
            self.total_findings,
            self.total_fixed,
            self.total_discarded,
            self.unresolved_findings.len()
        ));

        for record in &self.iterations {
            out.push_str(&format!("\n## Iteration {}\n\n", record.iteration));
            if record.findings.is_empty() {
                out.push_str("No findings.\n");
            }
            for finding in &record.findings {
                out.push_str(&format!(
                    "- {} [{}] {} ({}){}\n",
                    finding.severity.emoji(),
                    finding.severity,
                    finding.title,
                    finding.location(),
                    finding
                        .agent
                        .as_deref()
                        .map(|a| format!(" by {}", a))
                        .unwrap_or_default()
                ));
            }
            if !record.agent_failures.is_empty() {
                out.push_str(&format!(
                    "\nAgents failed: {}\n",
                    record.agent_failures.join(", ")
                ));
            }
            match record.gate_approved {
                Some(true) => out.push_str("\nGate: approved\n"),
                Some(false) => out.push_str("\nGate: rejected\n"),
                None => {}
            }
            if !record.fix_results.is_empty() {
                out.push_str("\nFixes:\n");
                for fix in &record.fix_results {
                    out.push_str(&format!(
                        "- {:?}: {}\n",
                        fix.status,
                        fix.title
                    ));
                }
            }
            if let Some(passed) = record.tests_passed {
                out.push_str(&format!(
                    "\nTests: {}\n",
                    if passed { "passed" } else { "failed" }
                ));
            }
        }

        if !self.unresolved_findings.is_empty() {
            out.push_str("\n## Unresolved\n\n");
            for finding in &self.unresolved_findings {
                out.push_str(&format!("- {}\n", finding));
            }
        }
        out
    }
}

/// JSON record path for an epic's review.
pub fn review_record_path(reviews_dir: &Path, epic_number: u32) -> PathBuf {
    reviews_dir.join(format!("epic-{}-review.json", epic_number))
}

/// Defaults used when no risk policy applies.
#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub default_agents: Vec<String>,
    pub default_max_iterations: u32,
    pub default_min_fix_severity: Severity,
    pub autonomous: bool,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        let tier = RiskTier::default();
        Self {
            default_agents: tier.agents,
            default_max_iterations: tier.max_iterations,
            default_min_fix_severity: tier.min_fix_severity,
            autonomous: false,
        }
    }
}

pub struct AdversarialLoop {
    agents: Arc<dyn AgentFactory>,
    fixer: Arc<dyn FixApplier>,
    tests: Arc<dyn TestRunner>,
    gate: Arc<dyn ApprovalGate>,
    progress: Arc<dyn ProgressSink>,
    settings: ReviewSettings,
    policy: Option<RiskPolicy>,
    rules: Option<RuleStore>,
    reviews_dir: Option<PathBuf>,
}

impl AdversarialLoop {
    pub fn new(
        agents: Arc<dyn AgentFactory>,
        fixer: Arc<dyn FixApplier>,
        tests: Arc<dyn TestRunner>,
        gate: Arc<dyn ApprovalGate>,
        progress: Arc<dyn ProgressSink>,
        settings: ReviewSettings,
    ) -> Self {
        Self {
            agents,
            fixer,
            tests,
            gate,
            progress,
            settings,
            policy: None,
            rules: None,
            reviews_dir: None,
        }
    }

    pub fn with_policy(mut self, policy: Option<RiskPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_rule_store(mut self, rules: RuleStore) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Where summaries (markdown + JSON) are written.
    pub fn with_reviews_dir(mut self, dir: PathBuf) -> Self {
        self.reviews_dir = Some(dir);
        self
    }

    /// Tier for a change set; without a policy, the untiered default.
    pub fn resolve_tier(&self, changed_files: &[String]) -> RiskTier {
        match &self.policy {
            Some(policy) => {
                let resolved = policy.resolve(changed_files);
                for assignment in &resolved.assignments {
                    debug!(
                        file = %assignment.file,
                        tier = %assignment.tier,
                        pattern = ?assignment.pattern,
                        "Risk tier assignment"
                    );
                }
                resolved.tier
            }
            None => RiskTier::untiered(
                self.settings.default_agents.clone(),
                self.settings.default_max_iterations,
                self.settings.default_min_fix_severity,
            ),
        }
    }

    pub async fn run(
        &self,
        project_dir: &Path,
        epic_number: u32,
        changed_files: Vec<String>,
    ) -> Result<AdversarialLoopResult> {
        let tier = self.resolve_tier(&changed_files);
        let gate_active = tier.require_approval && !self.settings.autonomous;
        info!(
            epic = epic_number,
            tier = %tier.name,
            max_iterations = tier.max_iterations,
            min_fix_severity = %tier.min_fix_severity,
            gate_active,
            "Starting adversarial review"
        );
        self.progress.emit(
            PipelinePhase::Reviewing,
            &format!(
                "Tier '{}' ({} changed file(s)): agents {}, up to {} iteration(s)",
                tier.name,
                changed_files.len(),
                tier.agents.join(", "),
                tier.max_iterations
            ),
        );

        let agents = tier
            .agents
            .iter()
            .map(|name| self.agents.create(name))
            .collect::<Result<Vec<_>>>()?;
        let known_rules = self.known_rules();

        let mut iterations: Vec<IterationRecord> = Vec::new();
        let mut all_fix_results: Vec<FixResult> = Vec::new();
        let mut total_fixed = 0;
        let mut total_discarded = 0;
        let mut exit_reason = ExitReason::MaxIterations;
        let mut last_eligible: Vec<ReviewFinding> = Vec::new();
        let mut last_deferred: Vec<ReviewFinding> = Vec::new();

        for iteration in 1..=tier.max_iterations {
            let ctx = ReviewContext {
                project_dir: project_dir.to_path_buf(),
                epic_number,
                iteration,
                changed_files: changed_files.clone(),
                feedback: None,
                known_rules: known_rules.clone(),
            };

            // Agents are read-only over the same snapshot; run them together.
            let reports = try_join_all(agents.iter().map(|agent| {
                let ctx = &ctx;
                async move {
                    agent
                        .run(ctx)
                        .await
                        .with_context(|| format!("Review agent '{}' failed", agent.name()))
                }
            }))
            .await?;

            let mut record = IterationRecord {
                iteration,
                ..Default::default()
            };
            for report in reports {
                if !report.success {
                    warn!(agent = %report.agent, report = %report.report, "Review agent reported failure");
                    self.progress.warn(
                        PipelinePhase::Reviewing,
                        &format!("agent '{}' did not complete its review", report.agent),
                    );
                    record.agent_failures.push(report.agent.clone());
                }
                for mut finding in report.findings {
                    if finding.agent.is_none() {
                        finding.agent = Some(report.agent.clone());
                    }
                    record.findings.push(finding);
                }
            }

            let (eligible, deferred) = partition_by_severity(&record.findings, tier.min_fix_severity);
            record.eligible = eligible.len();
            record.deferred = deferred.len();
            self.progress.emit(
                PipelinePhase::Reviewing,
                &format!(
                    "Iteration {}/{}: {} finding(s), {} eligible for fixing{}",
                    iteration,
                    tier.max_iterations,
                    record.findings.len(),
                    eligible.len(),
                    histogram_suffix(&record.findings)
                ),
            );

            if eligible.is_empty() {
                exit_reason = if record.agent_failures.is_empty() {
                    ExitReason::Converged
                } else {
                    warn!(
                        epic = epic_number,
                        iteration,
                        failed = ?record.agent_failures,
                        "No fix-eligible findings, but not every agent reported"
                    );
                    ExitReason::AgentFailure
                };
                last_eligible = eligible;
                last_deferred = deferred;
                iterations.push(record);
                break;
            }

            if gate_active {
                let summary = gate_summary(&tier, iteration, &eligible);
                match self.gate.decide(&summary).await? {
                    GateDecision::Approve => record.gate_approved = Some(true),
                    decision => {
                        info!(epic = epic_number, iteration, ?decision, "Review gate declined fixes");
                        record.gate_approved = Some(false);
                        last_eligible = eligible;
                        last_deferred = deferred;
                        iterations.push(record);
                        exit_reason = ExitReason::Rejected;
                        break;
                    }
                }
            }

            let mut fixes = self.fixer.apply(&eligible, &ctx).await?;
            let tests = self.tests.run().await.context("Test run after fixes failed")?;
            record.tests_passed = Some(tests.passed);

            let applied = fixes.iter().filter(|f| f.status == FixStatus::Applied).count();
            if tests.passed {
                total_fixed += applied;
            } else {
                warn!(epic = epic_number, iteration, applied, "Tests failed after fixes; discarding");
                self.progress.warn(
                    PipelinePhase::Reviewing,
                    &format!("tests failed after fixing; {} fix(es) discarded", applied),
                );
                for fix in fixes.iter_mut().filter(|f| f.status == FixStatus::Applied) {
                    fix.status = FixStatus::Discarded;
                }
                total_discarded += applied;
            }

            record.fix_results = fixes.clone();
            all_fix_results.extend(fixes);
            last_eligible = eligible;
            last_deferred = deferred;
            iterations.push(record);
        }

        let unresolved = unresolved_findings(
            exit_reason,
            &last_eligible,
            last_deferred,
            iterations.last().map(|r| r.fix_results.as_slice()).unwrap_or(&[]),
        );

        let result = AdversarialLoopResult {
            tier: tier.name.clone(),
            total_findings: iterations.iter().map(|r| r.findings.len()).sum(),
            converged: exit_reason == ExitReason::Converged,
            exit_reason,
            total_fixed,
            total_discarded,
            unresolved_findings: unresolved,
            all_fix_results,
            iterations,
        };

        info!(
            epic = epic_number,
            exit_reason = %result.exit_reason,
            iterations = result.iterations.len(),
            fixed = result.total_fixed,
            discarded = result.total_discarded,
            unresolved = result.unresolved_findings.len(),
            "Adversarial review finished"
        );
        self.progress.emit(
            PipelinePhase::Reviewing,
            &format!(
                "Review {} after {} iteration(s): {} fixed, {} unresolved",
                result.exit_reason,
                result.iterations.len(),
                result.total_fixed,
                result.unresolved_findings.len()
            ),
        );

        if let Err(e) = self.persist(&result, epic_number) {
            warn!(error = %e, "Failed to persist review summary");
            self.progress
                .warn(PipelinePhase::Reviewing, &format!("review summary not saved: {:#}", e));
        }
        self.learn_rules(&result);

        Ok(result)
    }

    fn known_rules(&self) -> Vec<String> {
        let Some(store) = &self.rules else {
            return Vec::new();
        };
        match store.guidance(RULE_GUIDANCE_LIMIT) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "Failed to load review rules");
                Vec::new()
            }
        }
    }

    fn persist(&self, result: &AdversarialLoopResult, epic_number: u32) -> Result<()> {
        let Some(dir) = &self.reviews_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let md = dir.join(format!("epic-{}-review.md", epic_number));
        std::fs::write(&md, result.summary_markdown(epic_number))
            .with_context(|| format!("Failed to write {}", md.display()))?;
        let json = review_record_path(dir, epic_number);
        let content =
            serde_json::to_string_pretty(result).context("Failed to serialize review record")?;
        std::fs::write(&json, content)
            .with_context(|| format!("Failed to write {}", json.display()))?;
        Ok(())
    }

    fn learn_rules(&self, result: &AdversarialLoopResult) {
        let Some(store) = &self.rules else {
            return;
        };
        let candidates = extract_candidates(&result.iterations);
        match store.merge(&candidates) {
            Ok(0) => {}
            Ok(added) => info!(added, store = %store.path().display(), "Learned new review rules"),
            Err(e) => {
                warn!(error = %e, "Rule extraction failed");
                self.progress
                    .warn(PipelinePhase::Reviewing, &format!("rule extraction failed: {:#}", e));
            }
        }
    }
}

fn histogram_suffix(findings: &[ReviewFinding]) -> String {
    let parts: Vec<String> = severity_histogram(findings)
        .into_iter()
        .map(|(s, n)| format!("{} {}", n, s))
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn gate_summary(tier: &RiskTier, iteration: u32, eligible: &[ReviewFinding]) -> String {
    let mut out = format!(
        "Review iteration {} (tier '{}') wants to auto-fix {} finding(s):\n\n",
        iteration,
        tier.name,
        eligible.len()
    );
    for finding in eligible {
        out.push_str(&format!("- {}\n", finding));
    }
    out
}

/// Findings left open by the final iteration.
fn unresolved_findings(
    exit_reason: ExitReason,
    eligible: &[ReviewFinding],
    deferred: Vec<ReviewFinding>,
    fixes: &[FixResult],
) -> Vec<ReviewFinding> {
    let mut unresolved = deferred;
    let fixed = |finding: &ReviewFinding| {
        fixes.iter().any(|fix| {
            fix.status == FixStatus::Applied && fix.title == finding.title && fix.file == finding.file
        })
    };
    for finding in eligible {
        if exit_reason == ExitReason::Rejected || !fixed(finding) {
            unresolved.push(finding.clone());
        }
    }
    unresolved.sort_by(|a, b| b.severity.cmp(&a.severity));
    unresolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::collaborators::{ReviewAgent, TestRunResult};
    use crate::review::findings::AgentReport;
    use crate::ui::RecordingProgress;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Returns scripted findings per call, repeating the last script.
    struct ScriptedAgent {
        name: String,
        script: Mutex<VecDeque<Vec<ReviewFinding>>>,
        last: Mutex<Vec<ReviewFinding>>,
    }

    #[async_trait]
    impl ReviewAgent for ScriptedAgent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _ctx: &ReviewContext) -> Result<AgentReport> {
            let next = self.script.lock().unwrap().pop_front();
            let findings = match next {
                Some(f) => {
                    *self.last.lock().unwrap() = f.clone();
                    f
                }
                None => self.last.lock().unwrap().clone(),
            };
            Ok(AgentReport::new(&self.name).with_findings(findings))
        }
    }

    struct Factory {
        scripts: Vec<Vec<ReviewFinding>>,
        created: Mutex<Vec<String>>,
        fail: bool,
        report_failure: bool,
    }

    impl Factory {
        fn new(scripts: Vec<Vec<ReviewFinding>>) -> Self {
            Self {
                scripts,
                created: Mutex::new(Vec::new()),
                fail: false,
                report_failure: false,
            }
        }
    }

    struct BrokenAgent;

    #[async_trait]
    impl ReviewAgent for BrokenAgent {
        fn name(&self) -> &str {
            "broken"
        }
        async fn run(&self, _ctx: &ReviewContext) -> Result<AgentReport> {
            anyhow::bail!("agent crashed")
        }
    }

    /// Runs but cannot produce a usable report.
    struct SilentAgent(String);

    #[async_trait]
    impl ReviewAgent for SilentAgent {
        fn name(&self) -> &str {
            &self.0
        }
        async fn run(&self, _ctx: &ReviewContext) -> Result<AgentReport> {
            Ok(AgentReport::failed(&self.0, "exit status 1"))
        }
    }

    impl AgentFactory for Factory {
        fn create(&self, name: &str) -> Result<Arc<dyn ReviewAgent>> {
            self.created.lock().unwrap().push(name.to_string());
            if self.fail {
                return Ok(Arc::new(BrokenAgent));
            }
            if self.report_failure {
                return Ok(Arc::new(SilentAgent(name.to_string())));
            }
            // Only the first agent reports findings.
            let script = if self.created.lock().unwrap().len() == 1 {
                self.scripts.clone()
            } else {
                vec![vec![]]
            };
            Ok(Arc::new(ScriptedAgent {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                last: Mutex::new(Vec::new()),
            }))
        }
    }

    #[derive(Default)]
    struct Fixer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FixApplier for Fixer {
        async fn apply(&self, findings: &[ReviewFinding], _ctx: &ReviewContext) -> Result<Vec<FixResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(findings
                .iter()
                .map(|f| FixResult::for_finding(f, FixStatus::Applied))
                .collect())
        }
    }

    struct Tests(bool);

    #[async_trait]
    impl TestRunner for Tests {
        async fn run(&self) -> Result<TestRunResult> {
            Ok(TestRunResult {
                passed: self.0,
                output: String::new(),
            })
        }
    }

    struct Gate {
        decision: GateDecision,
        calls: AtomicUsize,
    }

    impl Gate {
        fn new(decision: GateDecision) -> Self {
            Self {
                decision,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ApprovalGate for Gate {
        async fn decide(&self, _summary: &str) -> Result<GateDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision.clone())
        }
    }

    struct Harness {
        factory: Arc<Factory>,
        fixer: Arc<Fixer>,
        gate: Arc<Gate>,
        progress: Arc<RecordingProgress>,
        review: AdversarialLoop,
    }

    fn harness(
        scripts: Vec<Vec<ReviewFinding>>,
        tests_pass: bool,
        gate: GateDecision,
        settings: ReviewSettings,
    ) -> Harness {
        let factory = Arc::new(Factory::new(scripts));
        let fixer = Arc::new(Fixer::default());
        let gate = Arc::new(Gate::new(gate));
        let progress = Arc::new(RecordingProgress::new());
        let review = AdversarialLoop::new(
            factory.clone(),
            fixer.clone(),
            Arc::new(Tests(tests_pass)),
            gate.clone(),
            progress.clone(),
            settings,
        );
        Harness {
            factory,
            fixer,
            gate,
            progress,
            review,
        }
    }

    fn high(title: &str) -> ReviewFinding {
        ReviewFinding::new(title, Severity::High).with_file("src/lib.rs")
    }

    const GATED_POLICY: &str = r#"
[[tiers]]
name = "high"
patterns = ["src/**"]
max_iterations = 2
min_fix_severity = "high"
agents = ["security"]
require_approval = true

[[tiers]]
name = "low"
agents = ["code-quality"]
"#;

    #[tokio::test]
    async fn no_eligible_findings_converges_after_one_iteration() {
        let h = harness(
            vec![vec![ReviewFinding::new("nit", Severity::Low)]],
            true,
            GateDecision::Approve,
            ReviewSettings::default(),
        );
        let dir = tempdir().unwrap();
        let result = h.review.run(dir.path(), 1, vec![]).await.unwrap();

        assert!(result.converged);
        assert_eq!(result.exit_reason, ExitReason::Converged);
        assert_eq!(result.iterations.len(), 1);
        assert_eq!(h.fixer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.unresolved_findings.len(), 1);
        assert_eq!(result.total_findings, 1);
    }

    #[tokio::test]
    async fn persistent_findings_exhaust_budget() {
        let settings = ReviewSettings {
            default_max_iterations: 3,
            ..Default::default()
        };
        let h = harness(vec![vec![high("SQL injection")]], true, GateDecision::Approve, settings);
        let dir = tempdir().unwrap();
        let result = h.review.run(dir.path(), 1, vec![]).await.unwrap();

        assert!(!result.converged);
        assert_eq!(result.exit_reason, ExitReason::MaxIterations);
        assert_eq!(result.iterations.len(), 3);
        assert_eq!(h.fixer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.total_fixed, 3);
        // Applied fixes in the last iteration count as resolved.
        assert!(result.unresolved_findings.is_empty());
        assert_eq!(h.gate.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fixed_findings_converge_on_next_pass() {
        let h = harness(
            vec![vec![high("Unchecked unwrap")], vec![]],
            true,
            GateDecision::Approve,
            ReviewSettings::default(),
        );
        let dir = tempdir().unwrap();
        let result = h.review.run(dir.path(), 1, vec![]).await.unwrap();

        assert!(result.converged);
        assert_eq!(result.iterations.len(), 2);
        assert_eq!(result.total_fixed, 1);
        assert_eq!(result.iterations[0].tests_passed, Some(true));
        // Findings are tagged with the reporting agent.
        assert_eq!(
            result.iterations[0].findings[0].agent.as_deref(),
            Some("code-quality")
        );
    }

    #[tokio::test]
    async fn failing_tests_discard_fixes() {
        let settings = ReviewSettings {
            default_max_iterations: 1,
            ..Default::default()
        };
        let h = harness(vec![vec![high("Race condition")]], false, GateDecision::Approve, settings);
        let dir = tempdir().unwrap();
        let result = h.review.run(dir.path(), 1, vec![]).await.unwrap();

        assert_eq!(result.total_fixed, 0);
        assert_eq!(result.total_discarded, 1);
        assert_eq!(result.all_fix_results[0].status, FixStatus::Discarded);
        assert_eq!(result.unresolved_findings.len(), 1);
        assert!(h
            .progress
            .messages_for(PipelinePhase::Reviewing)
            .iter()
            .any(|m| m.contains("discarded")));
    }

    #[tokio::test]
    async fn gate_rejection_stops_before_fixing() {
        let h = harness(
            vec![vec![high("Hardcoded secret")]],
            true,
            GateDecision::reject("not now"),
            ReviewSettings::default(),
        );
        let review = h
            .review
            .with_policy(Some(RiskPolicy::parse(GATED_POLICY).unwrap()));
        let dir = tempdir().unwrap();
        let result = review
            .run(dir.path(), 1, vec!["src/auth.rs".to_string()])
            .await
            .unwrap();

        assert_eq!(result.exit_reason, ExitReason::Rejected);
        assert!(!result.converged);
        assert_eq!(result.iterations.len(), 1);
        assert_eq!(result.tier, "high");
        assert_eq!(h.fixer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unresolved_findings.len(), 1);
        assert_eq!(*h.factory.created.lock().unwrap(), vec!["security".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_gate_counts_as_rejection() {
        let h = harness(
            vec![vec![high("Hardcoded secret")]],
            true,
            GateDecision::Cancelled,
            ReviewSettings::default(),
        );
        let review = h
            .review
            .with_policy(Some(RiskPolicy::parse(GATED_POLICY).unwrap()));
        let dir = tempdir().unwrap();
        let result = review
            .run(dir.path(), 1, vec!["src/auth.rs".to_string()])
            .await
            .unwrap();
        assert_eq!(result.exit_reason, ExitReason::Rejected);
    }

    #[tokio::test]
    async fn autonomous_mode_skips_gate() {
        let settings = ReviewSettings {
            autonomous: true,
            ..Default::default()
        };
        let h = harness(
            vec![vec![high("Hardcoded secret")], vec![]],
            true,
            GateDecision::reject("never asked"),
            settings,
        );
        let review = h
            .review
            .with_policy(Some(RiskPolicy::parse(GATED_POLICY).unwrap()));
        let dir = tempdir().unwrap();
        let result = review
            .run(dir.path(), 1, vec!["src/auth.rs".to_string()])
            .await
            .unwrap();

        assert!(result.converged);
        assert_eq!(h.gate.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_files_use_lowest_tier_without_gate() {
        let h = harness(
            vec![vec![high("Hardcoded secret")], vec![]],
            true,
            GateDecision::reject("never asked"),
            ReviewSettings::default(),
        );
        let review = h
            .review
            .with_policy(Some(RiskPolicy::parse(GATED_POLICY).unwrap()));
        let dir = tempdir().unwrap();
        let result = review
            .run(dir.path(), 1, vec!["README.md".to_string()])
            .await
            .unwrap();

        assert_eq!(result.tier, "low");
        assert_eq!(h.gate.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*h.factory.created.lock().unwrap(), vec!["code-quality".to_string()]);
    }

    #[tokio::test]
    async fn approved_gate_fixes_and_keeps_passing_fixes() {
        let h = harness(
            vec![vec![high("Hardcoded secret")], vec![]],
            true,
            GateDecision::Approve,
            ReviewSettings::default(),
        );
        let review = h
            .review
            .with_policy(Some(RiskPolicy::parse(GATED_POLICY).unwrap()));
        let dir = tempdir().unwrap();
        let result = review
            .run(dir.path(), 1, vec!["src/auth.rs".to_string()])
            .await
            .unwrap();

        assert!(result.converged);
        assert_eq!(result.tier, "high");
        assert_eq!(result.iterations.len(), 2);
        assert_eq!(result.iterations[0].gate_approved, Some(true));
        assert_eq!(result.iterations[0].tests_passed, Some(true));
        // The quiet second pass converges before the gate is asked again.
        assert_eq!(result.iterations[1].gate_approved, None);
        assert_eq!(h.gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.fixer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.total_fixed, 1);
        assert_eq!(result.total_discarded, 0);
        assert_eq!(result.all_fix_results[0].status, FixStatus::Applied);
        assert!(result.unresolved_findings.is_empty());
    }

    #[tokio::test]
    async fn failed_agent_reports_are_not_convergence() {
        let mut factory = Factory::new(vec![]);
        factory.report_failure = true;
        let fixer = Arc::new(Fixer::default());
        let progress = Arc::new(RecordingProgress::new());
        let dir = tempdir().unwrap();
        let reviews = dir.path().join("reviews");
        let review = AdversarialLoop::new(
            Arc::new(factory),
            fixer.clone(),
            Arc::new(Tests(true)),
            Arc::new(Gate::new(GateDecision::Approve)),
            progress.clone(),
            ReviewSettings::default(),
        )
        .with_reviews_dir(reviews.clone());

        let result = review.run(dir.path(), 1, vec![]).await.unwrap();

        assert!(!result.converged);
        assert_eq!(result.exit_reason, ExitReason::AgentFailure);
        assert_eq!(result.iterations.len(), 1);
        assert_eq!(
            result.iterations[0].agent_failures,
            ["code-quality", "test-coverage", "security"]
        );
        assert_eq!(fixer.calls.load(Ordering::SeqCst), 0);
        assert!(progress
            .messages_for(PipelinePhase::Reviewing)
            .iter()
            .any(|m| m.contains("did not complete its review")));

        let md = std::fs::read_to_string(reviews.join("epic-1-review.md")).unwrap();
        assert!(md.contains("agent-failure"));
        assert!(md.contains("Agents failed: code-quality, test-coverage, security"));
    }

    #[tokio::test]
    async fn agent_error_propagates() {
        let mut factory = Factory::new(vec![]);
        factory.fail = true;
        let review = AdversarialLoop::new(
            Arc::new(factory),
            Arc::new(Fixer::default()),
            Arc::new(Tests(true)),
            Arc::new(Gate::new(GateDecision::Approve)),
            Arc::new(RecordingProgress::new()),
            ReviewSettings::default(),
        );
        let dir = tempdir().unwrap();
        let err = review.run(dir.path(), 1, vec![]).await.unwrap_err();
        assert!(format!("{:#}", err).contains("agent crashed"));
    }

    #[tokio::test]
    async fn summary_and_rules_are_persisted() {
        let settings = ReviewSettings {
            default_max_iterations: 2,
            ..Default::default()
        };
        let h = harness(vec![vec![high("Missing bounds check")]], true, GateDecision::Approve, settings);
        let dir = tempdir().unwrap();
        let reviews = dir.path().join("reviews");
        let store = RuleStore::new(dir.path().join("rules.json"));
        let review = h
            .review
            .with_reviews_dir(reviews.clone())
            .with_rule_store(store.clone());

        let result = review.run(dir.path(), 4, vec![]).await.unwrap();

        let md = std::fs::read_to_string(reviews.join("epic-4-review.md")).unwrap();
        assert!(md.contains("# Review: epic 4"));
        assert!(md.contains("## Iteration 2"));
        assert!(md.contains("max-iterations"));

        let reloaded = AdversarialLoopResult::load(&review_record_path(&reviews, 4)).unwrap();
        assert_eq!(reloaded, result);

        // The finding recurred across both iterations.
        let rules = store.load().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern, "missing bounds check");
    }

    #[test]
    fn exit_reason_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ExitReason::MaxIterations).unwrap(),
            "\"max-iterations\""
        );
        assert_eq!(ExitReason::Rejected.to_string(), "rejected");
    }
}
