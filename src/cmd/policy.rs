//! Risk policy inspection - `shipwright policy`.

use anyhow::Result;
use console::style;
use std::path::Path;

use shipwright::config::Config;

use super::super::PolicyCommands;

pub fn cmd_policy(project_dir: &Path, command: &PolicyCommands) -> Result<()> {
    let config = Config::new(project_dir)?;

    match command {
        PolicyCommands::Check { files } => {
            let Some(policy) = config.risk_policy()? else {
                let settings = config.review_settings();
                println!(
                    "No risk policy at {}; every change uses the default tier.",
                    config.policy_file().display()
                );
                println!(
                    "  agents: {}, max iterations: {}, min fix severity: {}",
                    settings.default_agents.join(", "),
                    settings.default_max_iterations,
                    settings.default_min_fix_severity
                );
                return Ok(());
            };

            let resolved = policy.resolve(files);
            println!();
            for assignment in &resolved.assignments {
                let reason = match &assignment.pattern {
                    Some(pattern) => format!("matches {}", pattern),
                    None => "no pattern matched".to_string(),
                };
                println!(
                    "  {:<40} {:<10} {}",
                    assignment.file,
                    assignment.tier,
                    style(reason).dim()
                );
            }
            println!();

            let tier = &resolved.tier;
            println!("Resolved tier: {}", style(&tier.name).bold());
            println!("  agents: {}", tier.agents.join(", "));
            println!("  max iterations: {}", tier.max_iterations);
            println!("  min fix severity: {}", tier.min_fix_severity);
            println!(
                "  human approval: {}",
                if tier.require_approval { "required" } else { "not required" }
            );
            println!();
        }
    }
    Ok(())
}
