//! Turns a markdown plan into an epic/story breakdown and per-epic plans.
//!
//! Recognised structure:
//!
//! ```text
//! ## Epic 1: Accounts
//! ### Story 1.1: Sign up
//! Free text describing the story.
//! ### Story 1.2: Log in
//!
//! ## Epic 2: Billing
//! - Invoices
//! - Refunds
//! ```
//!
//! Stories are `### Story N.M: Title` headings, or `- ` bullets when an epic
//! has no story headings. Epics are numbered by position.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::SHIPWRIGHT_DIR;
use crate::orchestrator::collaborators::{Bridge, Epic, EpicBreakdown, Plan, PlanMetadata, Story};

static EPIC_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s+Epic\s+[\w.]+\s*[:.\-]\s*(.+?)\s*$").unwrap());

static STORY_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^###\s+Story\s+([\w.]+)\s*[:.\-]\s*(.+?)\s*$").unwrap());

static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-*]\s+(.+?)\s*$").unwrap());

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownBridge;

impl MarkdownBridge {
    pub fn new() -> Self {
        Self
    }
}

fn parse_stories(epic_number: u32, body: &str) -> Vec<Story> {
    let mut stories: Vec<Story> = Vec::new();
    for line in body.lines() {
        if let Some(cap) = STORY_HEADING.captures(line) {
            stories.push(Story {
                id: cap[1].to_string(),
                title: cap[2].to_string(),
                description: String::new(),
            });
        } else if let Some(story) = stories.last_mut() {
            if !story.description.is_empty() || !line.trim().is_empty() {
                story.description.push_str(line);
                story.description.push('\n');
            }
        }
    }
    if !stories.is_empty() {
        for story in &mut stories {
            story.description = story.description.trim_end().to_string();
        }
        return stories;
    }

    body.lines()
        .filter_map(|line| BULLET.captures(line))
        .enumerate()
        .map(|(idx, cap)| Story {
            id: format!("{}.{}", epic_number, idx + 1),
            title: cap[1].to_string(),
            description: String::new(),
        })
        .collect()
}

impl Bridge for MarkdownBridge {
    fn parse(&self, plan_text: &str) -> Result<EpicBreakdown> {
        let mut sections: Vec<(String, String)> = Vec::new();
        for line in plan_text.lines() {
            if let Some(cap) = EPIC_HEADING.captures(line) {
                sections.push((cap[1].to_string(), String::new()));
            } else if let Some((_, body)) = sections.last_mut() {
                body.push_str(line);
                body.push('\n');
            }
        }

        let epics = sections
            .into_iter()
            .enumerate()
            .map(|(idx, (title, body))| {
                let number = idx as u32 + 1;
                Epic {
                    number,
                    title,
                    stories: parse_stories(number, &body),
                    stories_markdown: body.trim().to_string(),
                }
            })
            .collect();
        Ok(EpicBreakdown { epics })
    }

    fn convert(&self, breakdown: &EpicBreakdown, metadata: &PlanMetadata) -> Result<Plan> {
        let epic = breakdown.epic(metadata.epic_number).with_context(|| {
            format!(
                "Plan has no epic {} ({} epic(s) found)",
                metadata.epic_number,
                breakdown.epics.len()
            )
        })?;

        let mut md = format!("# Epic {}: {}\n\n", epic.number, epic.title);
        if !metadata.project_name.is_empty() {
            md.push_str(&format!("Project: {}\n", metadata.project_name));
        }
        if let Some(profile) = &metadata.profile {
            md.push_str(&format!("Developer: {} ({} stack)\n", profile.name, profile.stack));
            let prefs = profile.preference_lines();
            if !prefs.is_empty() {
                md.push_str("\nPreferences:\n");
                md.push_str(&prefs.join("\n"));
                md.push('\n');
            }
        }

        md.push_str("\n## Stories\n");
        if epic.stories.is_empty() {
            md.push_str("\nNo stories.\n");
        }
        for story in &epic.stories {
            md.push_str(&format!("\n### Story {}: {}\n", story.id, story.title));
            if !story.description.is_empty() {
                md.push('\n');
                md.push_str(&story.description);
                md.push('\n');
            }
        }

        Ok(Plan {
            epic_number: epic.number,
            title: epic.title.clone(),
            story_count: epic.stories.len(),
            markdown: md,
        })
    }

    fn save(&self, plan: &Plan, project_dir: &Path) -> Result<PathBuf> {
        let path = self.plan_path(project_dir, plan.epic_number);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, &plan.markdown)
            .with_context(|| format!("Failed to write plan: {}", path.display()))?;
        Ok(path)
    }

    fn plan_path(&self, project_dir: &Path, epic_number: u32) -> PathBuf {
        project_dir
            .join(SHIPWRIGHT_DIR)
            .join("plans")
            .join(format!("epic-{}.md", epic_number))
    }
}
