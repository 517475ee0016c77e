//! File-inbox messaging channel.
//!
//! The gate drops a `request-<id>.md` file into the inbox directory and waits.
//! Whoever answers (a human, a chat bridge, a script) writes
//! `decision-<id>.toml`:
//!
//! ```toml
//! action = "reject"          # approve | reject | cancel
//! feedback = "Tighten input validation on the signup form"
//! ```
//!
//! A background listener polls the directory, hands each decision to the
//! waiting gate and removes the answered request and decision files. A
//! malformed decision is reported once and left in place for correction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ApprovalGate, GateDecision, MessagingAdapter};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DecisionAction {
    Approve,
    Reject,
    Cancel,
}

#[derive(Debug, Deserialize)]
struct DecisionFile {
    action: DecisionAction,
    #[serde(default)]
    feedback: String,
}

impl From<DecisionFile> for GateDecision {
    fn from(file: DecisionFile) -> Self {
        match file.action {
            DecisionAction::Approve => GateDecision::Approve,
            DecisionAction::Reject => GateDecision::reject(file.feedback),
            DecisionAction::Cancel => GateDecision::Cancelled,
        }
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<GateDecision>>>>;

/// Background listener delivering inbox decisions to waiting gates.
pub struct InboxAdapter {
    dir: PathBuf,
    poll_interval: Duration,
    pending: Pending,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InboxAdapter {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            pending: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    fn register(&self, id: &str) -> Result<oneshot::Receiver<GateDecision>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| anyhow::anyhow!("inbox pending map poisoned"))?
            .insert(id.to_string(), tx);
        Ok(rx)
    }

    fn abort(&self) -> Option<JoinHandle<()>> {
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = &handle {
            handle.abort();
        }
        // Dropping the senders wakes every waiting gate.
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        handle
    }
}

/// Poll-to-poll memory of the listener.
#[derive(Debug, Default)]
struct InboxScan {
    /// Content of decision files already reported as malformed, by id.
    malformed: HashMap<String, String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct PollReport {
    delivered: usize,
    /// Malformed decision files warned about in this poll.
    warned: usize,
}

/// Deliver every decision file whose id has a waiting gate.
fn deliver(dir: &Path, pending: &Pending, scan: &mut InboxScan) -> Result<PollReport> {
    let mut report = PollReport::default();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read inbox: {}", dir.display()))?;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = name
            .strip_prefix("decision-")
            .and_then(|rest| rest.strip_suffix(".toml"))
        else {
            continue;
        };

        let sender = match pending.lock() {
            Ok(mut map) => map.remove(id),
            Err(_) => anyhow::bail!("inbox pending map poisoned"),
        };
        let Some(sender) = sender else {
            continue;
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "Decision file not readable yet");
                if let Ok(mut map) = pending.lock() {
                    map.insert(id.to_string(), sender);
                }
                continue;
            }
        };
        let decision = match toml::from_str::<DecisionFile>(&content) {
            Ok(file) => GateDecision::from(file),
            Err(e) => {
                if scan.malformed.get(id) != Some(&content) {
                    warn!(file = %path.display(), error = %e, "Ignoring malformed inbox decision");
                    scan.malformed.insert(id.to_string(), content);
                    report.warned += 1;
                }
                // Keep waiting for a corrected file.
                if let Ok(mut map) = pending.lock() {
                    map.insert(id.to_string(), sender);
                }
                continue;
            }
        };
        scan.malformed.remove(id);

        let request = dir.join(format!("request-{}.md", id));
        for file in [&path, &request] {
            if let Err(e) = std::fs::remove_file(file)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(file = %file.display(), error = %e, "Failed to remove answered inbox file");
            }
        }
        debug!(id, ?decision, "Delivering inbox decision");
        let _ = sender.send(decision);
        report.delivered += 1;
    }
    Ok(report)
}

#[async_trait]
impl MessagingAdapter for InboxAdapter {
    async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create inbox: {}", self.dir.display()))?;

        let dir = self.dir.clone();
        let pending = self.pending.clone();
        let interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut scan = InboxScan::default();
            loop {
                if let Err(e) = deliver(&dir, &pending, &mut scan) {
                    warn!(error = %e, "Inbox poll failed");
                }
                tokio::time::sleep(interval).await;
            }
        });

        let mut task = self
            .task
            .lock()
            .map_err(|_| anyhow::anyhow!("inbox task handle poisoned"))?;
        *task = Some(handle);
        info!(dir = %self.dir.display(), "Inbox listener started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.abort() {
            // An aborted task resolves to a cancellation error.
            let _ = handle.await;
            info!(dir = %self.dir.display(), "Inbox listener stopped");
        }
        Ok(())
    }
}

impl Drop for InboxAdapter {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Gate answered through the inbox.
pub struct InboxGate {
    adapter: Arc<InboxAdapter>,
}

impl InboxGate {
    pub fn new(adapter: Arc<InboxAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl ApprovalGate for InboxGate {
    async fn decide(&self, summary: &str) -> Result<GateDecision> {
        if !self.adapter.is_running() {
            anyhow::bail!("Inbox listener is not running; cannot wait for a decision");
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let rx = self.adapter.register(&id)?;

        let request = self.adapter.dir().join(format!("request-{}.md", id));
        let body = format!(
            "{}\n\n---\nAnswer by writing `decision-{}.toml` in this directory:\n\n\
             ```toml\naction = \"approve\"   # approve | reject | cancel\nfeedback = \"\"\n```\n",
            summary.trim_end(),
            id
        );
        tokio::fs::write(&request, body)
            .await
            .with_context(|| format!("Failed to write inbox request: {}", request.display()))?;
        info!(request = %request.display(), "Waiting for inbox decision");

        rx.await
            .map_err(|_| anyhow::anyhow!("Inbox listener stopped before decision {} arrived", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_adapter(dir: &Path) -> Arc<InboxAdapter> {
        Arc::new(InboxAdapter::new(dir.to_path_buf()).with_poll_interval(Duration::from_millis(10)))
    }

    async fn wait_for_request(dir: &Path) -> String {
        for _ in 0..500 {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if let Some(id) = name
                        .strip_prefix("request-")
                        .and_then(|r| r.strip_suffix(".md"))
                    {
                        return id.to_string();
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no inbox request appeared");
    }

    #[tokio::test]
    async fn decision_file_resolves_waiting_gate() {
        let dir = tempdir().unwrap();
        let adapter = fast_adapter(dir.path());
        adapter.start().await.unwrap();
        let gate = InboxGate::new(adapter.clone());

        let waiter = tokio::spawn(async move { gate.decide("Review summary").await });
        let id = wait_for_request(dir.path()).await;

        let request = std::fs::read_to_string(dir.path().join(format!("request-{}.md", id))).unwrap();
        assert!(request.starts_with("Review summary"));

        std::fs::write(
            dir.path().join(format!("decision-{}.toml", id)),
            "action = \"reject\"\nfeedback = \"add tests\"\n",
        )
        .unwrap();

        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(decision, GateDecision::reject("add tests"));
        assert!(!dir.path().join(format!("decision-{}.toml", id)).exists());
        assert!(!dir.path().join(format!("request-{}.md", id)).exists());

        adapter.stop().await.unwrap();
        assert!(!adapter.is_running());
    }

    #[tokio::test]
    async fn cancel_action_maps_to_cancelled() {
        let dir = tempdir().unwrap();
        let adapter = fast_adapter(dir.path());
        adapter.start().await.unwrap();
        let gate = InboxGate::new(adapter.clone());

        let waiter = tokio::spawn(async move { gate.decide("summary").await });
        let id = wait_for_request(dir.path()).await;
        std::fs::write(dir.path().join(format!("decision-{}.toml", id)), "action = \"cancel\"\n").unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), GateDecision::Cancelled);
        adapter.stop().await.unwrap();
    }

    #[test]
    fn malformed_decision_warns_once_per_content() {
        let dir = tempdir().unwrap();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert("abc".to_string(), tx);
        std::fs::write(dir.path().join("request-abc.md"), "summary").unwrap();
        let decision = dir.path().join("decision-abc.toml");
        let mut scan = InboxScan::default();

        std::fs::write(&decision, "action = \"maybe\"\n").unwrap();
        let first = deliver(dir.path(), &pending, &mut scan).unwrap();
        assert_eq!(first, PollReport { delivered: 0, warned: 1 });
        let again = deliver(dir.path(), &pending, &mut scan).unwrap();
        assert_eq!(again, PollReport { delivered: 0, warned: 0 });

        // A different broken edit is worth a new warning.
        std::fs::write(&decision, "action = \n").unwrap();
        assert_eq!(deliver(dir.path(), &pending, &mut scan).unwrap().warned, 1);

        std::fs::write(&decision, "action = \"approve\"\n").unwrap();
        let fixed = deliver(dir.path(), &pending, &mut scan).unwrap();
        assert_eq!(fixed, PollReport { delivered: 1, warned: 0 });
        assert_eq!(rx.try_recv().unwrap(), GateDecision::Approve);
        assert!(!decision.exists());
        assert!(!dir.path().join("request-abc.md").exists());
        assert!(scan.malformed.is_empty());
    }

    #[tokio::test]
    async fn gate_refuses_without_listener() {
        let dir = tempdir().unwrap();
        let gate = InboxGate::new(fast_adapter(dir.path()));
        assert!(gate.decide("summary").await.is_err());
    }

    #[tokio::test]
    async fn stop_wakes_waiting_gate_with_error() {
        let dir = tempdir().unwrap();
        let adapter = fast_adapter(dir.path());
        adapter.start().await.unwrap();
        let gate = InboxGate::new(adapter.clone());

        let waiter = tokio::spawn(async move { gate.decide("summary").await });
        wait_for_request(dir.path()).await;
        adapter.stop().await.unwrap();

        assert!(waiter.await.unwrap().is_err());
    }
}
