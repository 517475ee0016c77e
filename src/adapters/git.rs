use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Oid, Repository, Tree};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::warn;

use crate::config::SHIPWRIGHT_DIR;
use crate::orchestrator::collaborators::ChangeTracker;

/// Lists files changed in the project's working tree.
///
/// Changes are the diff of a base commit's tree against the index and
/// working directory, untracked files included, so work the build agent has
/// already committed still counts. Outside a repository nothing has changed.
pub struct GitChangeTracker {
    project_dir: PathBuf,
}

impl GitChangeTracker {
    pub fn new(project_dir: PathBuf) -> Self {
        Self { project_dir }
    }

    fn open(&self) -> Result<Option<Repository>> {
        match Repository::open(&self.project_dir) {
            Ok(repo) => Ok(Some(repo)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to open git repository"),
        }
    }
}

/// Tree of `since`, falling back to HEAD when the commit is gone.
/// `None` on an unborn branch: everything is new.
fn base_tree<'r>(repo: &'r Repository, since: Option<&str>) -> Option<Tree<'r>> {
    if let Some(id) = since {
        match Oid::from_str(id).and_then(|oid| repo.find_commit(oid)) {
            Ok(commit) => return commit.tree().ok(),
            Err(e) => warn!(base = id, error = %e, "Epic base commit not found; diffing against HEAD"),
        }
    }
    repo.head().ok().and_then(|head| head.peel_to_tree().ok())
}

impl ChangeTracker for GitChangeTracker {
    fn baseline(&self) -> Result<Option<String>> {
        let Some(repo) = self.open()? else {
            return Ok(None);
        };
        let head = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        Ok(head.map(|commit| commit.id().to_string()))
    }

    fn changed_files(&self, since: Option<&str>) -> Result<Vec<String>> {
        let Some(repo) = self.open()? else {
            return Ok(Vec::new());
        };
        let tree = base_tree(&repo, since);

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo
            .diff_tree_to_workdir_with_index(tree.as_ref(), Some(&mut opts))
            .context("Failed to diff working tree")?;

        let mut files = BTreeSet::new();
        for delta in diff.deltas() {
            let file = match delta.status() {
                Delta::Deleted => delta.old_file().path(),
                Delta::Added
                | Delta::Untracked
                | Delta::Modified
                | Delta::Renamed
                | Delta::Copied
                | Delta::Typechange => delta.new_file().path(),
                _ => None,
            };
            if let Some(path) = file
                && !path.starts_with(SHIPWRIGHT_DIR)
            {
                files.insert(path.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(files.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::path::Path;
    use tempfile::tempdir;

    fn commit_all(repo: &Repository) {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@localhost").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<_> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "snapshot", &tree, &parents)
            .unwrap();
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn outside_a_repository_nothing_changed() {
        let dir = tempdir().unwrap();
        let tracker = GitChangeTracker::new(dir.path().to_path_buf());
        assert!(tracker.changed_files(None).unwrap().is_empty());
    }

    #[test]
    fn lists_modified_added_and_deleted_files() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        write(dir.path(), "src/lib.rs", "pub fn a() {}\n");
        write(dir.path(), "README.md", "hi\n");
        commit_all(&repo);

        write(dir.path(), "src/lib.rs", "pub fn a() { todo() }\n");
        write(dir.path(), "src/auth/login.rs", "fn login() {}\n");
        std::fs::remove_file(dir.path().join("README.md")).unwrap();
        write(dir.path(), ".shipwright/state.json", "{}");

        let tracker = GitChangeTracker::new(dir.path().to_path_buf());
        assert_eq!(
            tracker.changed_files(None).unwrap(),
            ["README.md", "src/auth/login.rs", "src/lib.rs"]
        );
    }

    #[test]
    fn unborn_branch_reports_everything() {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        write(dir.path(), "main.py", "print('hi')\n");
        let tracker = GitChangeTracker::new(dir.path().to_path_buf());
        assert_eq!(tracker.changed_files(None).unwrap(), ["main.py"]);
    }

    #[test]
    fn committed_work_counts_since_the_epic_base() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        write(dir.path(), "src/lib.rs", "pub fn a() {}\n");
        commit_all(&repo);

        let tracker = GitChangeTracker::new(dir.path().to_path_buf());
        let base = tracker.baseline().unwrap().unwrap();

        write(dir.path(), "src/auth/login.rs", "fn login() {}\n");
        commit_all(&repo);
        write(dir.path(), "src/lib.rs", "pub fn a() { b() }\n");

        assert_eq!(
            tracker.changed_files(Some(&base)).unwrap(),
            ["src/auth/login.rs", "src/lib.rs"]
        );
        // Against HEAD, the committed file no longer shows up.
        assert_eq!(tracker.changed_files(None).unwrap(), ["src/lib.rs"]);
    }

    #[test]
    fn unknown_base_falls_back_to_head() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        write(dir.path(), "src/lib.rs", "pub fn a() {}\n");
        commit_all(&repo);
        write(dir.path(), "src/lib.rs", "pub fn a() { b() }\n");

        let tracker = GitChangeTracker::new(dir.path().to_path_buf());
        let missing = "1111111111111111111111111111111111111111";
        assert_eq!(tracker.changed_files(Some(missing)).unwrap(), ["src/lib.rs"]);
    }

    #[test]
    fn baseline_is_none_without_commits() {
        let dir = tempdir().unwrap();
        let tracker = GitChangeTracker::new(dir.path().to_path_buf());
        assert_eq!(tracker.baseline().unwrap(), None);
        Repository::init(dir.path()).unwrap();
        assert_eq!(tracker.baseline().unwrap(), None);
    }
}
