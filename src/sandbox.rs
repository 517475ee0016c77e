//! Sandboxed external command execution.
//!
//! Every process the pipeline spawns (build iterations, test runs, review
//! agents, deploy commands) goes through [`CommandRunner`], which:
//! 1. checks the command against the [`SandboxPolicy`] and refuses with a
//!    [`PolicyViolation`] on denial,
//! 2. applies the timeout of the command's [`CommandClass`],
//! 3. captures stdout and stderr.
//!
//! A timeout kills the child and surfaces as [`CommandError::Timeout`]; the
//! caller treats it as a failure of its phase.

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{CommandError, PolicyViolation};

/// Classes of external commands, each with its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Quick status checks (git status, version probes).
    Status,
    Build,
    Test,
    Deploy,
    /// Review, fix and code-generation agent invocations.
    Agent,
}

impl std::fmt::Display for CommandClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandClass::Status => "status",
            CommandClass::Build => "build",
            CommandClass::Test => "test",
            CommandClass::Deploy => "deploy",
            CommandClass::Agent => "agent",
        };
        f.write_str(s)
    }
}

/// Per-class timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub status: Duration,
    pub build: Duration,
    pub test: Duration,
    pub deploy: Duration,
    pub agent: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            status: Duration::from_secs(30),
            build: Duration::from_secs(30 * 60),
            test: Duration::from_secs(15 * 60),
            deploy: Duration::from_secs(20 * 60),
            agent: Duration::from_secs(10 * 60),
        }
    }
}

impl Timeouts {
    pub fn for_class(&self, class: CommandClass) -> Duration {
        match class {
            CommandClass::Status => self.status,
            CommandClass::Build => self.build,
            CommandClass::Test => self.test,
            CommandClass::Deploy => self.deploy,
            CommandClass::Agent => self.agent,
        }
    }
}

/// A command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: Option<String>,
    pub class: CommandClass,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, class: CommandClass) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            stdin: None,
            class,
        }
    }

    /// A command line run through `sh -c`.
    pub fn shell(command_line: &str, cwd: impl Into<PathBuf>, class: CommandClass) -> Self {
        Self::new("sh", cwd, class).args(["-c", command_line])
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Human-readable command line.
    pub fn display(&self) -> String {
        if self.is_shell() {
            return self.args[1].clone();
        }
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn is_shell(&self) -> bool {
        self.program == "sh" && self.args.len() >= 2 && self.args[0] == "-c"
    }

    /// The program actually being invoked; for `sh -c` the first word of the script.
    pub fn effective_program(&self) -> String {
        let raw = if self.is_shell() {
            self.args[1].split_whitespace().next().unwrap_or("").to_string()
        } else {
            self.program.clone()
        };
        Path::new(&raw)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(raw)
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// What commands may run, and where.
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    pub project_dir: PathBuf,
    /// Program basenames allowed to run; empty allows any program.
    pub allowed_programs: Vec<String>,
    /// Substrings that are never allowed in a command line.
    pub denied_patterns: Vec<String>,
    /// Directories besides the project dir a command may run in.
    pub allowed_dirs: Vec<PathBuf>,
}

impl SandboxPolicy {
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Default::default()
        }
    }

    pub fn check(&self, spec: &CommandSpec) -> Result<(), PolicyViolation> {
        let display = spec.display();

        if let Some(pattern) = self
            .denied_patterns
            .iter()
            .find(|p| !p.is_empty() && display.contains(p.as_str()))
        {
            return Err(PolicyViolation::new(
                display,
                format!("matches denied pattern '{}'", pattern),
            ));
        }

        if !self.allowed_programs.is_empty() {
            let program = spec.effective_program();
            if !self.allowed_programs.iter().any(|p| p == &program) {
                return Err(PolicyViolation::new(
                    display,
                    format!("program '{}' is not in the allow-list", program),
                ));
            }
        }

        let cwd = resolve(&spec.cwd);
        let inside = std::iter::once(&self.project_dir)
            .chain(self.allowed_dirs.iter())
            .any(|root| cwd.starts_with(resolve(root)));
        if !inside {
            return Err(PolicyViolation::new(
                display,
                format!(
                    "working directory {} escapes the allowed directories",
                    spec.cwd.display()
                ),
            ));
        }

        Ok(())
    }
}

/// Canonicalize when possible, otherwise normalize lexically.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Runs commands under a sandbox policy with per-class timeouts.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    policy: SandboxPolicy,
    timeouts: Timeouts,
}

impl CommandRunner {
    pub fn new(policy: SandboxPolicy, timeouts: Timeouts) -> Self {
        Self { policy, timeouts }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Run a command to completion.
    ///
    /// Errors carry a [`PolicyViolation`] or [`CommandError`] that callers can
    /// recover with `downcast_ref`. A non-zero exit is not an error.
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.policy.check(spec)?;

        let shown = spec.display();
        let timeout = self.timeouts.for_class(spec.class);
        debug!(command = %shown, class = %spec.class, timeout_secs = timeout.as_secs(), "Running command");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                command: shown.clone(),
                source,
            })?;

        // Fed concurrently so a child that fills its stdout pipe before
        // reading all of stdin cannot deadlock us.
        let writer = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            })),
            _ => None,
        };

        // Dropping the child on timeout kills it (kill_on_drop).
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("Failed to wait for `{}`", shown))?,
            Err(_) => {
                if let Some(writer) = &writer {
                    writer.abort();
                }
                return Err(CommandError::Timeout {
                    command: shown,
                    timeout,
                }
                .into());
            }
        };

        if let Some(writer) = writer {
            match writer.await.context("Stdin writer task failed")? {
                Ok(()) => {}
                // The child exited without reading all of its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(command = %shown, "Command closed stdin early");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to write stdin of `{}`", shown));
                }
            }
        }

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
