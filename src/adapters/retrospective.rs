//! File-based retrospective.
//!
//! Reads the per-epic review records and the deploy record, writes
//! `.shipwright/retrospective.md` and appends lessons to
//! `.shipwright/memory.jsonl`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::deploy::{DEPLOY_RECORD_FILE, DeployRecord};
use crate::orchestrator::collaborators::{
    MemoryEntry, Retrospective, RetrospectiveData, RetrospectiveOptions,
};
use crate::review::adversarial::{AdversarialLoopResult, review_record_path};

pub const REPORT_FILE: &str = "retrospective.md";
pub const MEMORY_FILE: &str = "memory.jsonl";

pub struct FileRetrospective {
    shipwright_dir: PathBuf,
    reviews_dir: PathBuf,
}

impl FileRetrospective {
    pub fn new(shipwright_dir: PathBuf, reviews_dir: PathBuf) -> Self {
        Self {
            shipwright_dir,
            reviews_dir,
        }
    }

    fn deploy_url(&self) -> Option<String> {
        let path = self.shipwright_dir.join(DEPLOY_RECORD_FILE);
        let content = std::fs::read_to_string(path).ok()?;
        let record: DeployRecord = serde_json::from_str(&content).ok()?;
        record.success.then_some(record.url).flatten()
    }
}

#[async_trait]
impl Retrospective for FileRetrospective {
    async fn analyze(&self, options: &RetrospectiveOptions) -> Result<RetrospectiveData> {
        let mut data = RetrospectiveData {
            epics_completed: options.epics_completed,
            deploy_url: self.deploy_url(),
            ..Default::default()
        };
        let mut recurring: BTreeMap<String, (String, usize)> = BTreeMap::new();

        for epic in 1..=options.epics_completed {
            let path = review_record_path(&self.reviews_dir, epic);
            if !path.exists() {
                debug!(epic, "No review record");
                continue;
            }
            let review = match AdversarialLoopResult::load(&path) {
                Ok(r) => r,
                Err(e) => {
                    warn!(epic, error = %e, "Skipping unreadable review record");
                    continue;
                }
            };
            data.review_iterations += review.iterations.len() as u32;
            data.total_findings += review.total_findings;
            data.total_fixed += review.total_fixed;
            data.total_discarded += review.total_discarded;
            data.unresolved += review.unresolved_findings.len();
            if !review.converged {
                data.unconverged_epics.push(epic);
                data.lessons.push(format!(
                    "Epic {} review stopped ({}) with {} unresolved finding(s)",
                    epic,
                    review.exit_reason,
                    review.unresolved_findings.len()
                ));
            }
            for finding in review.iterations.iter().flat_map(|i| i.findings.iter()) {
                recurring
                    .entry(finding.normalized_title())
                    .or_insert_with(|| (finding.title.clone(), 0))
                    .1 += 1;
            }
        }

        let mut repeated: Vec<_> = recurring.into_values().filter(|(_, n)| *n > 1).collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (title, count) in repeated.into_iter().take(5) {
            data.lessons
                .push(format!("Recurring finding: {} ({} times)", title, count));
        }
        if data.total_discarded > 0 {
            data.lessons.push(format!(
                "{} fix(es) were discarded because tests failed afterwards",
                data.total_discarded
            ));
        }
        Ok(data)
    }

    async fn report(&self, data: &RetrospectiveData) -> Result<PathBuf> {
        let mut md = String::from("# Retrospective\n\n");
        md.push_str(&format!("- Epics completed: {}\n", data.epics_completed));
        md.push_str(&format!("- Review iterations: {}\n", data.review_iterations));
        md.push_str(&format!(
            "- Findings: {} total, {} fixed, {} discarded, {} unresolved\n",
            data.total_findings, data.total_fixed, data.total_discarded, data.unresolved
        ));
        if !data.unconverged_epics.is_empty() {
            let epics: Vec<String> = data.unconverged_epics.iter().map(u32::to_string).collect();
            md.push_str(&format!("- Unconverged epics: {}\n", epics.join(", ")));
        }
        if let Some(url) = &data.deploy_url {
            md.push_str(&format!("- Deployed: {}\n", url));
        }
        md.push_str("\n## Lessons\n\n");
        if data.lessons.is_empty() {
            md.push_str("None recorded.\n");
        }
        for lesson in &data.lessons {
            md.push_str(&format!("- {}\n", lesson));
        }

        std::fs::create_dir_all(&self.shipwright_dir)
            .with_context(|| format!("Failed to create {}", self.shipwright_dir.display()))?;
        let path = self.shipwright_dir.join(REPORT_FILE);
        std::fs::write(&path, md)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn save_memory(&self, entries: &[MemoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.shipwright_dir)
            .with_context(|| format!("Failed to create {}", self.shipwright_dir.display()))?;
        let path = self.shipwright_dir.join(MEMORY_FILE);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        for entry in entries {
            let line = serde_json::to_string(entry).context("Failed to serialize memory entry")?;
            writeln!(file, "{}", line)
                .with_context(|| format!("Failed to append to {}", path.display()))?;
        }
        Ok(())
    }
}
