//! Developer profile loading.
//!
//! The profile is owned outside the pipeline; Shipwright only reads it. It is
//! looked up in `<project>/.shipwright/profile.toml` first and then in
//! `~/.shipwright/profile.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PROFILE_FILE: &str = "profile.toml";

/// Technology stack used to pick scaffolding defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stack {
    Rust,
    Node,
    Python,
    #[default]
    Generic,
}

impl std::fmt::Display for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stack::Rust => "rust",
            Stack::Node => "node",
            Stack::Python => "python",
            Stack::Generic => "generic",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Stack {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rust" => Ok(Self::Rust),
            "node" | "nodejs" | "typescript" => Ok(Self::Node),
            "python" => Ok(Self::Python),
            "generic" => Ok(Self::Generic),
            _ => anyhow::bail!(
                "Invalid stack '{}'. Valid values: rust, node, python, generic",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeveloperProfile {
    pub name: String,
    #[serde(default)]
    pub stack: Stack,
    /// Free-form preferences forwarded to agents (e.g. `style = "functional"`).
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
}

impl DeveloperProfile {
    pub fn new(name: impl Into<String>, stack: Stack) -> Self {
        Self {
            name: name.into(),
            stack,
            preferences: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse profile: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize profile")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write profile: {}", path.display()))
    }

    /// Locate and load the profile for a project, if any exists.
    pub fn discover(shipwright_dir: &Path) -> Result<Option<Self>> {
        for candidate in candidate_paths(shipwright_dir) {
            if candidate.exists() {
                return Self::load(&candidate).map(Some);
            }
        }
        Ok(None)
    }

    /// Render preferences as prompt lines.
    pub fn preference_lines(&self) -> Vec<String> {
        self.preferences
            .iter()
            .map(|(k, v)| format!("- {}: {}", k, v))
            .collect()
    }
}

fn candidate_paths(shipwright_dir: &Path) -> Vec<PathBuf> {
    let mut paths = vec![shipwright_dir.join(PROFILE_FILE)];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".shipwright").join(PROFILE_FILE));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_minimal_profile() {
        let profile: DeveloperProfile = toml::from_str("name = \"ada\"").unwrap();
        assert_eq!(profile.name, "ada");
        assert_eq!(profile.stack, Stack::Generic);
        assert!(profile.preferences.is_empty());
    }

    #[test]
    fn project_profile_is_discovered() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROFILE_FILE),
            "name = \"grace\"\nstack = \"rust\"\n\n[preferences]\ntesting = \"property-based\"\n",
        )
        .unwrap();

        let profile = DeveloperProfile::discover(dir.path()).unwrap().unwrap();
        assert_eq!(profile.name, "grace");
        assert_eq!(profile.stack, Stack::Rust);
        assert_eq!(
            profile.preference_lines(),
            vec!["- testing: property-based".to_string()]
        );
    }

    #[test]
    fn stack_names_parse_loosely() {
        assert_eq!("Rust".parse::<Stack>().unwrap(), Stack::Rust);
        assert_eq!("typescript".parse::<Stack>().unwrap(), Stack::Node);
        assert!("cobol".parse::<Stack>().is_err());
    }

    #[test]
    fn saved_profile_is_discovered_again() {
        let dir = tempdir().unwrap();
        let profile = DeveloperProfile::new("lin", Stack::Python);
        profile.save(&dir.path().join(PROFILE_FILE)).unwrap();
        assert_eq!(DeveloperProfile::discover(dir.path()).unwrap(), Some(profile));
    }

    #[test]
    fn malformed_profile_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(PROFILE_FILE), "stack = [").unwrap();
        assert!(DeveloperProfile::discover(dir.path()).is_err());
    }
}
