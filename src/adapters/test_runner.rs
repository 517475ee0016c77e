use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::orchestrator::collaborators::{TestRunResult, TestRunner};
use crate::sandbox::{CommandClass, CommandRunner, CommandSpec};

/// Runs `[commands].test` in the project directory.
///
/// With no command configured the suite passes trivially.
pub struct ShellTestRunner {
    command: Option<String>,
    project_dir: PathBuf,
    runner: CommandRunner,
}

impl ShellTestRunner {
    pub fn new(command: Option<String>, project_dir: PathBuf, runner: CommandRunner) -> Self {
        Self {
            command,
            project_dir,
            runner,
        }
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run(&self) -> Result<TestRunResult> {
        let Some(command) = &self.command else {
            return Ok(TestRunResult {
                passed: true,
                output: "No test command configured".to_string(),
            });
        };
        let spec = CommandSpec::shell(command, &self.project_dir, CommandClass::Test);
        let output = self.runner.run(&spec).await?;
        debug!(command = %command, exit_code = ?output.exit_code, "Test run finished");
        Ok(TestRunResult {
            passed: output.success(),
            output: output.combined(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PolicyViolation;
    use crate::sandbox::{SandboxPolicy, Timeouts};
    use tempfile::tempdir;

    fn runner(dir: &std::path::Path) -> CommandRunner {
        CommandRunner::new(SandboxPolicy::for_project(dir), Timeouts::default())
    }

    #[tokio::test]
    async fn no_command_passes() {
        let dir = tempdir().unwrap();
        let tests = ShellTestRunner::new(None, dir.path().to_path_buf(), runner(dir.path()));
        assert!(tests.run().await.unwrap().passed);
    }

    #[tokio::test]
    async fn reports_exit_status_and_output() {
        let dir = tempdir().unwrap();
        let passing = ShellTestRunner::new(
            Some("echo 12 passed".into()),
            dir.path().to_path_buf(),
            runner(dir.path()),
        );
        let result = passing.run().await.unwrap();
        assert!(result.passed);
        assert!(result.output.contains("12 passed"));

        let failing = ShellTestRunner::new(
            Some("echo 1 failed >&2; exit 1".into()),
            dir.path().to_path_buf(),
            runner(dir.path()),
        );
        let result = failing.run().await.unwrap();
        assert!(!result.passed);
        assert!(result.output.contains("1 failed"));
    }

    #[tokio::test]
    async fn denied_command_surfaces_policy_violation() {
        let dir = tempdir().unwrap();
        let policy = SandboxPolicy {
            denied_patterns: vec!["git push --force".into()],
            ..SandboxPolicy::for_project(dir.path())
        };
        let tests = ShellTestRunner::new(
            Some("git push --force origin main".into()),
            dir.path().to_path_buf(),
            CommandRunner::new(policy, Timeouts::default()),
        );
        let err = tests.run().await.unwrap_err();
        assert!(err.downcast_ref::<PolicyViolation>().is_some());
    }
}
