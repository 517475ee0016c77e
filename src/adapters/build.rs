//! Build iterations driven by the agent CLI.
//!
//! Each iteration hands the agent the epic's plan and asks it to implement
//! the next unfinished story. The agent reports back with tags:
//!
//! - `<story-result status="passed" id="1.2"/>` or
//!   `<story-result status="failed" id="1.2">reason</story-result>`
//! - `<all-complete/>` once every story in the plan is done
//! - `<no-stories/>` when the plan has nothing to build

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

use crate::orchestrator::collaborators::{BuildIterationResult, BuildIterator, BuildOutcome};
use crate::review::agents::AgentCli;
use crate::sandbox::CommandClass;

static STORY_RESULT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<story-result\b([^>]*?)(?:/>|>(.*?)</story-result>)").unwrap()
});

static ATTRIBUTE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w-]+)\s*=\s*"([^"]*)""#).unwrap());

static ALL_COMPLETE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<all-complete\s*/?>").unwrap());

static NO_STORIES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<no-stories\s*/?>").unwrap());

/// Interpret one iteration's agent output.
pub fn parse_build_output(output: &str) -> BuildIterationResult {
    let all_complete = ALL_COMPLETE_REGEX.is_match(output);

    // The last reported story is the one this iteration worked on.
    if let Some(cap) = STORY_RESULT_REGEX.captures_iter(output).last() {
        let attrs: HashMap<&str, &str> = ATTRIBUTE_REGEX
            .captures_iter(cap.get(1).map_or("", |m| m.as_str()))
            .filter_map(|a| Some((a.get(1)?.as_str(), a.get(2)?.as_str())))
            .collect();
        let story = attrs.get("id").copied().unwrap_or("").to_string();
        let body = cap.get(2).map_or("", |m| m.as_str()).trim();

        let mut result = match attrs.get("status").copied() {
            Some("passed") => BuildIterationResult::new(BuildOutcome::Passed),
            Some(status) => BuildIterationResult::new(BuildOutcome::Failed).with_error(
                if body.is_empty() {
                    format!("story reported status '{}'", status)
                } else {
                    body.to_string()
                },
            ),
            None => BuildIterationResult::new(BuildOutcome::Failed)
                .with_error("story-result tag without a status"),
        };
        if !story.is_empty() {
            result = result.with_story(story);
        }
        result.all_complete = all_complete && result.outcome == BuildOutcome::Passed;
        return result;
    }

    if all_complete {
        return BuildIterationResult::new(BuildOutcome::AllComplete);
    }
    if NO_STORIES_REGEX.is_match(output) {
        return BuildIterationResult::new(BuildOutcome::NoStories);
    }
    BuildIterationResult::new(BuildOutcome::Failed)
        .with_error("agent output contained no story result")
}

pub struct AgentBuildIterator {
    cli: AgentCli,
}

impl AgentBuildIterator {
    pub fn new(cli: AgentCli) -> Self {
        Self { cli }
    }

    fn prompt(plan: &str, epic_number: u32) -> String {
        format!(
            "You are implementing epic {epic} of this project. The plan follows.\n\n\
             {plan}\n\n\
             Implement the next story that is not yet done, including tests, and make \
             sure the test suite passes. Then report exactly one result tag:\n\
             <story-result status=\"passed\" id=\"STORY_ID\"/>\n\
             or, if you could not finish it,\n\
             <story-result status=\"failed\" id=\"STORY_ID\">what went wrong</story-result>\n\
             When every story in the plan is done, also print <all-complete/>. \
             If the plan has no stories, print <no-stories/>.\n",
            epic = epic_number,
            plan = plan.trim()
        )
    }
}

#[async_trait]
impl BuildIterator for AgentBuildIterator {
    async fn run_one(
        &self,
        project_dir: &Path,
        plan_path: &Path,
        model: Option<&str>,
        epic_number: u32,
    ) -> Result<BuildIterationResult> {
        let plan = std::fs::read_to_string(plan_path)
            .with_context(|| format!("Failed to read plan: {}", plan_path.display()))?;

        let mut cli = self.cli.clone();
        if let Some(model) = model {
            cli.model = Some(model.to_string());
        }
        let mut spec = cli.spec(project_dir, Self::prompt(&plan, epic_number));
        spec.class = CommandClass::Build;

        let output = cli.runner.run(&spec).await?;
        if !output.success() {
            let detail = output.combined();
            let detail = detail.trim();
            return Ok(BuildIterationResult::new(BuildOutcome::Failed).with_error(format!(
                "agent exited with {:?}{}",
                output.exit_code,
                if detail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", crate::deploy::truncate_chars(detail, 500))
                }
            )));
        }

        let result = parse_build_output(&output.stdout);
        debug!(
            epic = epic_number,
            outcome = ?result.outcome,
            story = ?result.story,
            all_complete = result.all_complete,
            "Build iteration finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CommandRunner, SandboxPolicy, Timeouts};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn passed_story() {
        let r = parse_build_output("working...\n<story-result status=\"passed\" id=\"1.2\"/>\n");
        assert_eq!(r.outcome, BuildOutcome::Passed);
        assert_eq!(r.story.as_deref(), Some("1.2"));
        assert!(!r.all_complete);
    }

    #[test]
    fn passed_story_with_all_complete() {
        let r = parse_build_output(
            "<story-result id=\"2.3\" status=\"passed\"></story-result>\n<all-complete />",
        );
        assert_eq!(r.outcome, BuildOutcome::Passed);
        assert_eq!(r.story.as_deref(), Some("2.3"));
        assert!(r.all_complete);
    }

    #[test]
    fn failed_story_carries_reason() {
        let r = parse_build_output(
            "<story-result status=\"failed\" id=\"1.1\">\n  migrations do not apply\n</story-result>",
        );
        assert_eq!(r.outcome, BuildOutcome::Failed);
        assert_eq!(r.story.as_deref(), Some("1.1"));
        assert_eq!(r.error.as_deref(), Some("migrations do not apply"));
    }

    #[test]
    fn last_story_result_wins() {
        let r = parse_build_output(
            "<story-result status=\"failed\" id=\"1.1\">flaky</story-result>\n\
             retrying\n<story-result status=\"passed\" id=\"1.1\"/>",
        );
        assert_eq!(r.outcome, BuildOutcome::Passed);
    }

    #[test]
    fn bare_completion_tags() {
        assert_eq!(parse_build_output("<all-complete/>").outcome, BuildOutcome::AllComplete);
        assert!(parse_build_output("<all-complete/>").all_complete);
        assert_eq!(parse_build_output("<no-stories/>").outcome, BuildOutcome::NoStories);
    }

    #[test]
    fn silence_is_a_failure() {
        let r = parse_build_output("I made some changes.");
        assert_eq!(r.outcome, BuildOutcome::Failed);
        assert!(r.error.unwrap().contains("no story result"));
    }

    fn script_cli(dir: &Path, body: &str) -> AgentCli {
        let script = dir.join("fake-agent");
        std::fs::write(&script, format!("#!/bin/sh\ncat > /dev/null\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        AgentCli {
            command: script.to_string_lossy().to_string(),
            model: None,
            skip_permissions: false,
            runner: CommandRunner::new(SandboxPolicy::for_project(dir), Timeouts::default()),
        }
    }

    #[tokio::test]
    async fn runs_agent_with_plan() {
        let dir = tempdir().unwrap();
        let plan = dir.path().join("epic-1.md");
        std::fs::write(&plan, "# Epic 1\n### Story 1.1: Sign up\n").unwrap();
        let cli = script_cli(
            dir.path(),
            "echo '<story-result status=\"passed\" id=\"1.1\"/>'; echo '<all-complete/>'",
        );

        let result = AgentBuildIterator::new(cli)
            .run_one(dir.path(), &plan, Some("sonnet"), 1)
            .await
            .unwrap();
        assert_eq!(result.outcome, BuildOutcome::Passed);
        assert!(result.all_complete);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failed_iteration() {
        let dir = tempdir().unwrap();
        let plan = dir.path().join("epic-1.md");
        std::fs::write(&plan, "# Epic 1\n").unwrap();
        let cli = script_cli(dir.path(), "echo 'rate limited' >&2; exit 3");

        let result = AgentBuildIterator::new(cli)
            .run_one(dir.path(), &plan, None, 1)
            .await
            .unwrap();
        assert_eq!(result.outcome, BuildOutcome::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("Some(3)"));
        assert!(error.contains("rate limited"));
    }

    #[tokio::test]
    async fn missing_plan_is_an_error() {
        let dir = tempdir().unwrap();
        let cli = script_cli(dir.path(), "true");
        assert!(
            AgentBuildIterator::new(cli)
                .run_one(dir.path(), &dir.path().join("nope.md"), None, 1)
                .await
                .is_err()
        );
    }
}
