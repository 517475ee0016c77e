//! Default implementations of the pipeline's collaborators.
//!
//! [`default_collaborators`] wires them to a project's configuration; tests
//! and embedders build a [`Collaborators`] of their own instead.

pub mod build;
pub mod git;
pub mod markdown_bridge;
pub mod retrospective;
pub mod scaffold;
pub mod test_runner;

use std::sync::Arc;

use crate::config::Config;
use crate::deploy::ShellDeployer;
use crate::gates::{ApprovalGate, AutoApproveGate, build_gate};
use crate::orchestrator::collaborators::{Collaborators, Deployer};
use crate::review::agents::{CliAgentFactory, CliFixApplier};
use crate::ui::ProgressSink;

pub use build::AgentBuildIterator;
pub use git::GitChangeTracker;
pub use markdown_bridge::MarkdownBridge;
pub use retrospective::FileRetrospective;
pub use scaffold::StackScaffolder;
pub use test_runner::ShellTestRunner;

/// Collaborators backed by the agent CLI, the shell and the filesystem.
///
/// Autonomous runs get a gate that always approves and no messaging
/// listener.
pub fn default_collaborators(config: &Config, progress: Arc<dyn ProgressSink>) -> Collaborators {
    let cli = config.agent_cli();
    let runner = config.command_runner();

    let (gate, messaging) = if config.autonomous {
        (Arc::new(AutoApproveGate) as Arc<dyn ApprovalGate>, None)
    } else {
        build_gate(config.toml.pipeline.approval_channel, config.inbox_dir())
    };

    let deployer = config.toml.commands.deploy.as_ref().map(|command| {
        Arc::new(ShellDeployer::new(command.clone(), runner.clone())) as Arc<dyn Deployer>
    });

    Collaborators {
        bridge: Arc::new(MarkdownBridge::new()),
        scaffolder: Arc::new(StackScaffolder),
        default_files: scaffold::default_file_generators(&config.project_name()),
        builder: Arc::new(AgentBuildIterator::new(cli.clone())),
        agents: Arc::new(CliAgentFactory::new(cli.clone())),
        fixer: Arc::new(CliFixApplier::new(cli)),
        tests: Arc::new(ShellTestRunner::new(
            config.toml.commands.test.clone(),
            config.project_dir.clone(),
            runner,
        )),
        changes: Arc::new(GitChangeTracker::new(config.project_dir.clone())),
        deployer,
        retrospective: Arc::new(FileRetrospective::new(
            config.shipwright_dir.clone(),
            config.reviews_dir(),
        )),
        gate,
        messaging,
        progress,
    }
}
