//! Approval gates: pluggable approve / reject / feedback decision sources.
//!
//! A gate is consulted by the adversarial review loop (when the resolved risk
//! tier requires approval) and by the sign-off protocol. Two channels exist:
//! an interactive terminal prompt and a file inbox served by a background
//! listener ([`inbox`]).

pub mod inbox;

use anyhow::{Context, Result};
use async_trait::async_trait;
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use inbox::{InboxAdapter, InboxGate};

/// Outcome of one gate consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Approve,
    Reject { feedback: String },
    /// The decision source was dismissed without an answer.
    Cancelled,
}

impl GateDecision {
    pub fn reject(feedback: impl Into<String>) -> Self {
        Self::Reject {
            feedback: feedback.into(),
        }
    }
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Present `summary` and wait for a decision.
    async fn decide(&self, summary: &str) -> Result<GateDecision>;
}

/// A background listener that lives for the duration of one pipeline run.
#[async_trait]
pub trait MessagingAdapter: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Configured decision channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalChannel {
    #[default]
    Interactive,
    Inbox,
}

impl std::fmt::Display for ApprovalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalChannel::Interactive => f.write_str("interactive"),
            ApprovalChannel::Inbox => f.write_str("inbox"),
        }
    }
}

/// Gate and optional listener for a channel.
pub fn build_gate(
    channel: ApprovalChannel,
    inbox_dir: std::path::PathBuf,
) -> (Arc<dyn ApprovalGate>, Option<Arc<dyn MessagingAdapter>>) {
    match channel {
        ApprovalChannel::Interactive => (Arc::new(InteractiveGate::new()), None),
        ApprovalChannel::Inbox => {
            let adapter = Arc::new(InboxAdapter::new(inbox_dir));
            let gate = Arc::new(InboxGate::new(adapter.clone()));
            (gate, Some(adapter))
        }
    }
}

/// Always approves. Used when no human is in the loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApproveGate;

#[async_trait]
impl ApprovalGate for AutoApproveGate {
    async fn decide(&self, _summary: &str) -> Result<GateDecision> {
        Ok(GateDecision::Approve)
    }
}

/// Terminal prompt via `dialoguer`.
#[derive(Debug, Default, Clone, Copy)]
pub struct InteractiveGate;

impl InteractiveGate {
    pub fn new() -> Self {
        Self
    }

    fn prompt(summary: &str) -> Result<GateDecision> {
        println!();
        println!("{}", style("─".repeat(60)).dim());
        println!("{}", summary.trim_end());
        println!("{}", style("─".repeat(60)).dim());

        let options = &["Approve", "Reject with feedback", "Cancel"];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Decision")
            .items(options)
            .default(0)
            .interact_opt()?;

        match selection {
            Some(0) => Ok(GateDecision::Approve),
            Some(1) => {
                let feedback: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Feedback")
                    .allow_empty(true)
                    .interact_text()?;
                Ok(GateDecision::reject(feedback))
            }
            _ => Ok(GateDecision::Cancelled),
        }
    }
}

#[async_trait]
impl ApprovalGate for InteractiveGate {
    async fn decide(&self, summary: &str) -> Result<GateDecision> {
        let summary = summary.to_string();
        tokio::task::spawn_blocking(move || Self::prompt(&summary))
            .await
            .context("Interactive prompt task panicked")?
    }
}
