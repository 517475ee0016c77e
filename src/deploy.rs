//! Deployment: shell deployer and the redacted deploy record.
//!
//! The record is written after every attempt, successful or not. Output is
//! redacted before truncation so a secret straddling the cut is still caught,
//! and nothing unredacted ever reaches disk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

use crate::orchestrator::collaborators::{DeployOptions, DeployResult, Deployer};
use crate::sandbox::{CommandClass, CommandRunner, CommandSpec};

pub const REDACTED: &str = "[REDACTED]";
pub const MAX_OUTPUT_CHARS: usize = 2000;
pub const DEPLOY_RECORD_FILE: &str = "deploy-result.json";

/// `name = value`, `name: "value"` and JSON's `"name": "value"`.
static ASSIGNMENT_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b([A-Z0-9_\-]*(?:key|token|secret|password|passwd|pwd)[A-Z0-9_\-]*)(["']?\s*[=:]\s*)(?:"([^"]*)"|'([^']*)'|[^\s"',;}]+)"#,
    )
    .unwrap()
});

static BEARER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/]+=*").unwrap());

static URL_CREDENTIALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-zA-Z][a-zA-Z0-9+.\-]*://)[^\s/:@]+:[^\s/@]+@").unwrap());

static KNOWN_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sk_(?:live|test)_[A-Za-z0-9]+|gh[pousr]_[A-Za-z0-9]{16,}|xox[abp]-[A-Za-z0-9\-]+)\b")
        .unwrap()
});

static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>)]+"#).unwrap());

/// Replace credential-shaped substrings with [`REDACTED`].
pub fn redact(text: &str) -> String {
    let text = URL_CREDENTIALS.replace_all(text, format!("${{1}}{}@", REDACTED).as_str());
    let text = BEARER_TOKEN.replace_all(&text, format!("${{1}} {}", REDACTED).as_str());
    let text = ASSIGNMENT_SECRET.replace_all(&text, |caps: &Captures| {
        let quote = if caps.get(3).is_some() {
            "\""
        } else if caps.get(4).is_some() {
            "'"
        } else {
            ""
        };
        format!("{}{}{q}{}{q}", &caps[1], &caps[2], REDACTED, q = quote)
    });
    KNOWN_TOKEN.replace_all(&text, REDACTED).into_owned()
}

/// First `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// First http(s) URL in the text.
pub fn extract_url(text: &str) -> Option<String> {
    URL.find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
}

/// What is persisted after a deploy attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    pub success: bool,
    pub url: Option<String>,
    pub provider: String,
    pub error: Option<String>,
    pub output: String,
    pub timestamp: DateTime<Utc>,
}

impl DeployRecord {
    pub fn from_result(result: &DeployResult) -> Self {
        Self {
            success: result.success,
            url: result.url.as_deref().map(redact),
            provider: result.provider.clone(),
            error: result.error.as_deref().map(redact),
            output: truncate_chars(&redact(&result.output), MAX_OUTPUT_CHARS),
            timestamp: Utc::now(),
        }
    }

    /// Record for a deployer that returned an error instead of a result.
    pub fn from_error(provider: &str, error: &anyhow::Error) -> Self {
        Self::from_result(&DeployResult {
            success: false,
            url: None,
            provider: provider.to_string(),
            error: Some(format!("{:#}", error)),
            output: String::new(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize deploy record")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write deploy record: {}", path.display()))
    }
}

/// Runs the configured deploy command.
pub struct ShellDeployer {
    command: String,
    runner: CommandRunner,
}

impl ShellDeployer {
    pub fn new(command: impl Into<String>, runner: CommandRunner) -> Self {
        Self {
            command: command.into(),
            runner,
        }
    }
}

#[async_trait]
impl Deployer for ShellDeployer {
    async fn deploy(&self, options: &DeployOptions) -> Result<DeployResult> {
        debug!(target = %options.target, command = %self.command, "Deploying");
        let spec = CommandSpec::shell(&self.command, &options.project_dir, CommandClass::Deploy);
        let output = self.runner.run(&spec).await?;
        let combined = output.combined();
        let success = output.success();
        Ok(DeployResult {
            success,
            url: if success { extract_url(&output.stdout) } else { None },
            provider: options.provider.clone(),
            error: (!success).then(|| format!("deploy command exited with {:?}", output.exit_code)),
            output: combined,
        })
    }
}
