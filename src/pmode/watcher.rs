use crate::pmode::store::PModeStore;
use crate::pmode::{load_directory, PModeLoadReport, RECEIVING_DIR, SENDING_DIR};
use crate::transport::runtime::sleep_with_shutdown;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

type Fingerprint = BTreeMap<PathBuf, (Option<SystemTime>, u64)>;

/// Polls the PMode directory and swaps a freshly loaded snapshot into the
/// store whenever a file is added, removed or modified.
pub struct PModeWatcher {
    root: PathBuf,
    store: Arc<PModeStore>,
    interval: Duration,
    fingerprint: Fingerprint,
}

impl PModeWatcher {
    pub fn new(root: impl Into<PathBuf>, store: Arc<PModeStore>, interval: Duration) -> Self {
        Self {
            root: root.into(),
            store,
            interval,
            fingerprint: Fingerprint::new(),
        }
    }

    /// Loads the directory unconditionally and installs the result. Returns
    /// false when the directory could not be read.
    pub fn reload(&mut self) -> bool {
        self.fingerprint = fingerprint(&self.root);
        match load_directory(&self.root) {
            Ok(PModeLoadReport {
                snapshot,
                rejected,
                warnings,
            }) => {
                for err in &rejected {
                    tracing::warn!(error = %err, "pmode rejected");
                }
                for warning in &warnings {
                    tracing::warn!(warning = %warning, "pmode configuration warning");
                }
                let loaded = snapshot.len();
                let generation = self.store.replace(snapshot);
                tracing::info!(
                    root = %self.root.display(),
                    loaded = loaded,
                    rejected = rejected.len(),
                    generation = generation,
                    "pmode snapshot installed"
                );
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "pmode directory unreadable; keeping previous snapshot");
                false
            }
        }
    }

    /// True when something under the directory changed since the last load.
    pub fn poll_changed(&mut self) -> bool {
        fingerprint(&self.root) != self.fingerprint
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            if sleep_with_shutdown(self.interval, &shutdown).await {
                break;
            }
            if self.poll_changed() {
                self.reload();
            }
        }
        tracing::debug!(root = %self.root.display(), "pmode watcher stopped");
    }
}

fn fingerprint(root: &Path) -> Fingerprint {
    let mut entries = Fingerprint::new();
    for sub in [SENDING_DIR, RECEIVING_DIR] {
        let Ok(dir) = std::fs::read_dir(root.join(sub)) else {
            continue;
        };
        for entry in dir.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    entries.insert(entry.path(), (meta.modified().ok(), meta.len()));
                }
            }
        }
    }
    entries
}
