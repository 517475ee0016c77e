//! Sign-off protocol.
//!
//! Each attempt renders the review summary and ends in `approve` or
//! `reject(feedback)`. A rejection with feedback triggers a fix cycle
//! addressing that feedback, after which the summary is regenerated and
//! sign-off is attempted again. Cancelling the decision source ends the
//! protocol with a rejection and no fix cycle.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::orchestrator::collaborators::{
    AgentFactory, ApprovalGate, FixApplier, FixResult, FixStatus, GateDecision, ReviewContext,
};
use crate::phase::PipelinePhase;
use crate::review::adversarial::AdversarialLoopResult;
use crate::review::findings::ReviewFinding;
use crate::ui::ProgressSink;

/// Agents run, in order, by every fix cycle.
pub const FIX_CYCLE_AGENTS: [&str; 4] = ["refactoring", "test-hardening", "security", "smoke-test"];
pub const NO_FEEDBACK: &str = "No feedback provided.";
pub const CANCELLED_FEEDBACK: &str = "Sign-off cancelled by user.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SignOffDecision {
    Approve,
    Reject { feedback: String },
}

impl SignOffDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, SignOffDecision::Approve)
    }
}

/// One rejection and the fix cycle it triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixCycle {
    pub feedback: String,
    pub findings: Vec<ReviewFinding>,
    pub fix_results: Vec<FixResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOffOutcome {
    pub decision: SignOffDecision,
    pub rejection_cycles: u32,
    pub cycles: Vec<FixCycle>,
}

pub struct SignOffProtocol {
    gate: Arc<dyn ApprovalGate>,
    agents: Arc<dyn AgentFactory>,
    fixer: Arc<dyn FixApplier>,
    progress: Arc<dyn ProgressSink>,
    autonomous: bool,
    max_rejection_cycles: Option<u32>,
}

impl SignOffProtocol {
    pub fn new(
        gate: Arc<dyn ApprovalGate>,
        agents: Arc<dyn AgentFactory>,
        fixer: Arc<dyn FixApplier>,
        progress: Arc<dyn ProgressSink>,
        autonomous: bool,
    ) -> Self {
        Self {
            gate,
            agents,
            fixer,
            progress,
            autonomous,
            max_rejection_cycles: None,
        }
    }

    /// Stop after this many rejections; `0` means unbounded.
    pub fn with_max_rejection_cycles(mut self, max: u32) -> Self {
        self.max_rejection_cycles = (max > 0).then_some(max);
        self
    }

    /// One decision, normalized. The flag is true when the source was cancelled.
    pub async fn attempt(&self, summary: &str) -> Result<(SignOffDecision, bool)> {
        if self.autonomous {
            return Ok((SignOffDecision::Approve, false));
        }
        let decision = self
            .gate
            .decide(summary)
            .await
            .context("Sign-off decision source failed")?;
        Ok(match decision {
            GateDecision::Approve => (SignOffDecision::Approve, false),
            GateDecision::Reject { feedback } => {
                let feedback = if feedback.trim().is_empty() {
                    NO_FEEDBACK.to_string()
                } else {
                    feedback.trim().to_string()
                };
                (SignOffDecision::Reject { feedback }, false)
            }
            GateDecision::Cancelled => (
                SignOffDecision::Reject {
                    feedback: CANCELLED_FEEDBACK.to_string(),
                },
                true,
            ),
        })
    }

    pub async fn run(
        &self,
        ctx: &ReviewContext,
        review: Option<&AdversarialLoopResult>,
    ) -> Result<SignOffOutcome> {
        let mut cycles: Vec<FixCycle> = Vec::new();
        loop {
            let summary = render_summary(ctx.epic_number, review, &cycles);
            let (decision, cancelled) = self.attempt(&summary).await?;
            let rejection_cycles = cycles.len() as u32;

            let feedback = match &decision {
                SignOffDecision::Approve => {
                    info!(epic = ctx.epic_number, rejection_cycles, "Sign-off approved");
                    self.progress.emit(
                        PipelinePhase::SignOff,
                        &format!("Epic {} approved", ctx.epic_number),
                    );
                    return Ok(SignOffOutcome {
                        decision,
                        rejection_cycles,
                        cycles,
                    });
                }
                SignOffDecision::Reject { feedback } => feedback.clone(),
            };

            let capped = self
                .max_rejection_cycles
                .is_some_and(|max| rejection_cycles + 1 >= max);
            if cancelled || capped {
                warn!(epic = ctx.epic_number, cancelled, feedback = %feedback, "Sign-off rejected");
                self.progress.emit(
                    PipelinePhase::SignOff,
                    &format!("Epic {} rejected: {}", ctx.epic_number, feedback),
                );
                return Ok(SignOffOutcome {
                    decision,
                    rejection_cycles: rejection_cycles + 1,
                    cycles,
                });
            }

            self.progress.emit(
                PipelinePhase::SignOff,
                &format!(
                    "Rejected (cycle {}): {}. Running fix cycle",
                    rejection_cycles + 1,
                    feedback
                ),
            );
            let cycle = self.fix_cycle(ctx, &feedback).await?;
            cycles.push(cycle);
        }
    }

    /// Run the fix-cycle agents in order and apply everything they find.
    async fn fix_cycle(&self, ctx: &ReviewContext, feedback: &str) -> Result<FixCycle> {
        let ctx = ReviewContext {
            feedback: Some(feedback.to_string()),
            ..ctx.clone()
        };
        let mut findings = Vec::new();
        for name in FIX_CYCLE_AGENTS {
            let agent = self.agents.create(name)?;
            let report = agent
                .run(&ctx)
                .await
                .with_context(|| format!("Fix-cycle agent '{}' failed", name))?;
            if !report.success {
                warn!(agent = name, "Fix-cycle agent reported failure");
            }
            findings.extend(report.findings.into_iter().map(|mut f| {
                f.agent.get_or_insert_with(|| name.to_string());
                f
            }));
        }

        let fix_results = if findings.is_empty() {
            Vec::new()
        } else {
            self.fixer.apply(&findings, &ctx).await?
        };
        let applied = fix_results
            .iter()
            .filter(|f| f.status == FixStatus::Applied)
            .count();
        self.progress.emit(
            PipelinePhase::SignOff,
            &format!(
                "Fix cycle: {} finding(s), {} fix(es) applied",
                findings.len(),
                applied
            ),
        );

        Ok(FixCycle {
            feedback: feedback.to_string(),
            findings,
            fix_results,
        })
    }
}

/// Summary shown to whoever signs off.
pub fn render_summary(
    epic_number: u32,
    review: Option<&AdversarialLoopResult>,
    cycles: &[FixCycle],
) -> String {
    let mut out = match review {
        Some(result) => result.summary_markdown(epic_number),
        None => format!(
            "# Review: epic {}\n\nNo review record was found for this epic.\n",
            epic_number
        ),
    };
    for (i, cycle) in cycles.iter().enumerate() {
        out.push_str(&format!(
            "\n## Sign-off fix cycle {}\n\nFeedback: {}\n\n",
            i + 1,
            cycle.feedback
        ));
        if cycle.fix_results.is_empty() {
            out.push_str("No changes were needed.\n");
        }
        for fix in &cycle.fix_results {
            out.push_str(&format!("- {:?}: {}\n", fix.status, fix.title));
        }
    }
    out
}
