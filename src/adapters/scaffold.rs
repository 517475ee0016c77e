//! Project scaffolding and the default files written alongside it.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::orchestrator::collaborators::{
    DefaultFileGenerator, GeneratedFile, ScaffoldResult, Scaffolder,
};
use crate::profile::{DeveloperProfile, Stack};

/// Standard directories for each stack.
pub fn stack_directories(stack: Stack) -> &'static [&'static str] {
    match stack {
        Stack::Rust => &["src", "tests"],
        Stack::Node => &["src", "test"],
        Stack::Python => &["src", "tests"],
        Stack::Generic => &["src", "docs"],
    }
}

/// Creates the stack's directories. Nothing that already exists is touched.
#[derive(Debug, Default, Clone, Copy)]
pub struct StackScaffolder;

impl Scaffolder for StackScaffolder {
    fn scaffold(&self, profile: &DeveloperProfile, project_dir: &Path) -> Result<ScaffoldResult> {
        let mut result = ScaffoldResult::default();
        for dir in stack_directories(profile.stack) {
            let path = project_dir.join(dir);
            if path.exists() {
                debug!(dir = %path.display(), "Directory exists");
                continue;
            }
            std::fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            // Keep the empty directory visible to git.
            let keep = path.join(".gitkeep");
            std::fs::write(&keep, "")
                .with_context(|| format!("Failed to write {}", keep.display()))?;
            result.directories.push(PathBuf::from(dir));
            result.files.push(PathBuf::from(dir).join(".gitkeep"));
        }
        Ok(result)
    }
}

pub struct GitignoreGenerator;

impl DefaultFileGenerator for GitignoreGenerator {
    fn name(&self) -> &str {
        "gitignore"
    }

    fn generate(&self, profile: &DeveloperProfile) -> Vec<GeneratedFile> {
        let stack_entries = match profile.stack {
            Stack::Rust => "/target\n",
            Stack::Node => "node_modules/\ndist/\n",
            Stack::Python => "__pycache__/\n*.pyc\n.venv/\n",
            Stack::Generic => "",
        };
        vec![GeneratedFile {
            filepath: PathBuf::from(".gitignore"),
            content: format!(
                "{}.env\n.DS_Store\n.shipwright/logs/\n.shipwright/inbox/\n",
                stack_entries
            ),
        }]
    }
}

pub struct ReadmeGenerator {
    project_name: String,
}

impl ReadmeGenerator {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
        }
    }
}

impl DefaultFileGenerator for ReadmeGenerator {
    fn name(&self) -> &str {
        "readme"
    }

    fn generate(&self, profile: &DeveloperProfile) -> Vec<GeneratedFile> {
        vec![GeneratedFile {
            filepath: PathBuf::from("README.md"),
            content: format!(
                "# {}\n\nA {} project. Plans live in `.shipwright/plans/`.\n",
                self.project_name, profile.stack
            ),
        }]
    }
}

pub struct EditorconfigGenerator;

impl DefaultFileGenerator for EditorconfigGenerator {
    fn name(&self) -> &str {
        "editorconfig"
    }

    fn generate(&self, profile: &DeveloperProfile) -> Vec<GeneratedFile> {
        let indent = match profile.stack {
            Stack::Node => 2,
            _ => 4,
        };
        vec![GeneratedFile {
            filepath: PathBuf::from(".editorconfig"),
            content: format!(
                "root = true\n\n[*]\nend_of_line = lf\ninsert_final_newline = true\nindent_style = space\nindent_size = {}\n",
                indent
            ),
        }]
    }
}

pub fn default_file_generators(project_name: &str) -> Vec<Arc<dyn DefaultFileGenerator>> {
    vec![
        Arc::new(GitignoreGenerator),
        Arc::new(ReadmeGenerator::new(project_name)),
        Arc::new(EditorconfigGenerator),
    ]
}
