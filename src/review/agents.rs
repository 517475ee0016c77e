//! Review and fix agents backed by the agent CLI.
//!
//! Each agent is one `--print` invocation with the prompt on stdin. Review
//! agents answer with a JSON object (fenced or bare):
//!
//! ```json
//! {
//!   "summary": "Two issues in the session handling",
//!   "findings": [
//!     {"title": "Token logged in plaintext", "severity": "critical",
//!      "file": "src/session.rs", "description": "..."}
//!   ],
//!   "blocking_issues": []
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::PolicyViolation;
use crate::orchestrator::collaborators::{
    AgentFactory, FixApplier, FixResult, FixStatus, ReviewAgent, ReviewContext,
};
use crate::review::findings::{AgentReport, ReviewFinding, Severity};
use crate::sandbox::{CommandClass, CommandRunner, CommandSpec};

/// Focus areas per known agent name.
pub fn focus_areas(agent: &str) -> &'static [&'static str] {
    match agent {
        "code-quality" => &[
            "error handling and panics",
            "dead or duplicated code",
            "naming and readability",
        ],
        "test-coverage" => &[
            "untested public behavior",
            "missing edge-case tests",
            "assertions that cannot fail",
        ],
        "security" => &[
            "injection (SQL, shell, path traversal)",
            "secrets in code or logs",
            "missing authentication or authorization checks",
        ],
        "refactoring" => &[
            "structure that makes the requested change hard",
            "overly long functions",
        ],
        "test-hardening" => &["flaky tests", "tests that depend on ordering or time"],
        "smoke-test" => &[
            "the application starts",
            "the primary user flow works end to end",
        ],
        _ => &["correctness", "maintainability"],
    }
}

/// How the agent CLI is invoked.
#[derive(Debug, Clone)]
pub struct AgentCli {
    pub command: String,
    pub model: Option<String>,
    pub skip_permissions: bool,
    pub runner: CommandRunner,
}

impl AgentCli {
    /// Command for one prompt, run in `cwd`.
    pub fn spec(&self, cwd: &Path, prompt: String) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.command, cwd, CommandClass::Agent);
        if self.skip_permissions {
            spec = spec.arg("--dangerously-skip-permissions");
        }
        spec = spec.arg("--print").stdin(prompt);
        if let Some(model) = &self.model {
            spec = spec.arg("--model").arg(model);
        }
        spec
    }
}

pub struct CliReviewAgent {
    name: String,
    cli: AgentCli,
}

impl CliReviewAgent {
    pub fn new(name: impl Into<String>, cli: AgentCli) -> Self {
        Self {
            name: name.into(),
            cli,
        }
    }

    fn prompt(&self, ctx: &ReviewContext) -> String {
        let focus = focus_areas(&self.name)
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");
        let files = if ctx.changed_files.is_empty() {
            "(no tracked changes; review the project as a whole)".to_string()
        } else {
            ctx.changed_files
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let rules = if ctx.known_rules.is_empty() {
            String::new()
        } else {
            format!(
                "\n## Known recurring issues\n\n{}\n",
                ctx.known_rules
                    .iter()
                    .map(|r| format!("- {}", r))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        };
        let feedback = ctx
            .feedback
            .as_deref()
            .map(|f| format!("\n## Reviewer feedback to address\n\n{}\n", f))
            .unwrap_or_default();

        format!(
            r#"You are the {name} reviewer for epic {epic}, review iteration {iteration}.

## Focus areas

{focus}

## Changed files

{files}
{rules}{feedback}
## Output format

Respond with a single JSON object:

```json
{{
  "summary": "one paragraph",
  "findings": [
    {{"title": "...", "severity": "critical|high|medium|low|info", "file": "path", "description": "..."}}
  ],
  "blocking_issues": []
}}
```

Return an empty findings array when nothing in your focus areas needs attention.
"#,
            name = self.name,
            epic = ctx.epic_number,
            iteration = ctx.iteration,
        )
    }
}

#[async_trait]
impl ReviewAgent for CliReviewAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ReviewContext) -> Result<AgentReport> {
        let output = self.cli.runner.run(&self.cli.spec(&ctx.project_dir, self.prompt(ctx))).await?;
        if !output.success() {
            return Ok(AgentReport::failed(
                &self.name,
                format!(
                    "agent exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(parse_review_output(&self.name, &output.stdout))
    }
}

/// Turn agent output into a report; unparseable output is a failed report.
pub fn parse_review_output(agent: &str, output: &str) -> AgentReport {
    let Some(value) = extract_json(output).and_then(|j| serde_json::from_str::<serde_json::Value>(&j).ok())
    else {
        return AgentReport::failed(agent, "review output could not be parsed");
    };

    // A bare array is accepted as the findings list.
    let (findings_value, summary, blocking) = match &value {
        serde_json::Value::Array(_) => (Some(&value), String::new(), Vec::new()),
        _ => (
            value.get("findings"),
            value
                .get("summary")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            value
                .get("blocking_issues")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        ),
    };

    let findings = findings_value
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(parse_finding).collect())
        .unwrap_or_default();

    AgentReport {
        agent: agent.to_string(),
        success: true,
        report: summary,
        findings,
        blocking_issues: blocking,
    }
}

fn parse_finding(value: &serde_json::Value) -> Option<ReviewFinding> {
    let title = value
        .get("title")
        .or_else(|| value.get("issue"))
        .and_then(|v| v.as_str())?;
    let severity = value
        .get("severity")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Severity>().ok())
        .unwrap_or_default();

    let mut finding = ReviewFinding::new(title, severity);
    if let Some(file) = value.get("file").and_then(|v| v.as_str()) {
        finding = finding.with_file(file);
    }
    if let Some(description) = value.get("description").and_then(|v| v.as_str()) {
        finding = finding.with_description(description);
    }
    Some(finding)
}

/// Pull a JSON object or array out of text that may wrap it in markdown.
fn extract_json(output: &str) -> Option<String> {
    if let Some(start) = output.find("```json") {
        let after = &output[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim().to_string());
        }
    }

    let start = output.find(['{', '['])?;
    let (open, close) = if output[start..].starts_with('{') {
        ('{', '}')
    } else {
        ('[', ']')
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in output[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(output[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Creates [`CliReviewAgent`]s by name.
pub struct CliAgentFactory {
    cli: AgentCli,
}

impl CliAgentFactory {
    pub fn new(cli: AgentCli) -> Self {
        Self { cli }
    }
}

impl AgentFactory for CliAgentFactory {
    fn create(&self, name: &str) -> Result<Arc<dyn ReviewAgent>> {
        if name.trim().is_empty() {
            anyhow::bail!("Review agent name cannot be empty");
        }
        Ok(Arc::new(CliReviewAgent::new(name, self.cli.clone())))
    }
}

/// Applies one fix per finding, sequentially.
pub struct CliFixApplier {
    cli: AgentCli,
}

impl CliFixApplier {
    pub fn new(cli: AgentCli) -> Self {
        Self { cli }
    }

    fn prompt(finding: &ReviewFinding, ctx: &ReviewContext) -> String {
        let mut prompt = format!(
            "Fix the following {} issue in this project (epic {}).\n\n\
             Title: {}\nLocation: {}\n\n{}\n\n\
             Change only what is needed to resolve it and keep the test suite passing.\n",
            finding.severity,
            ctx.epic_number,
            finding.title,
            finding.location(),
            finding.description
        );
        if let Some(feedback) = &ctx.feedback {
            prompt.push_str(&format!("\nReviewer feedback:\n{}\n", feedback));
        }
        prompt
    }
}

#[async_trait]
impl FixApplier for CliFixApplier {
    async fn apply(
        &self,
        findings: &[ReviewFinding],
        ctx: &ReviewContext,
    ) -> Result<Vec<FixResult>> {
        let mut results = Vec::with_capacity(findings.len());
        for finding in findings {
            let spec = self.cli.spec(&ctx.project_dir, Self::prompt(finding, ctx));
            let result = match self.cli.runner.run(&spec).await {
                Ok(out) if out.success() => FixResult::for_finding(finding, FixStatus::Applied),
                Ok(out) => FixResult::for_finding(finding, FixStatus::Failed)
                    .with_detail(tail(&out.combined(), 500)),
                // Policy denials are never downgraded to a failed fix.
                Err(e) if e.downcast_ref::<PolicyViolation>().is_some() => return Err(e),
                Err(e) => {
                    warn!(finding = %finding.title, error = %e, "Fix attempt failed");
                    FixResult::for_finding(finding, FixStatus::Failed).with_detail(e.to_string())
                }
            };
            debug!(finding = %finding.title, status = ?result.status, "Fix attempt finished");
            results.push(result);
        }
        Ok(results)
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
