// src/aggregator.rs
// File aggregator (spec section 4.4): merges remote inventories into a
// checksum -> peers index using per-peer diffing (Open Question #1, resolved
// in SPEC_FULL.md / DESIGN.md in favor of the spec's prescribed semantics,
// not the original's global-array diff).

use crate::model::{FileEntry, PeerId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// One peer announcing its current complete inventory.
#[derive(Debug, Clone)]
pub struct RemoteInventory {
    pub peer: PeerId,
    pub files: Vec<FileEntry>,
}

#[derive(Default)]
struct AggregatorState {
    file_index: HashMap<String, HashSet<PeerId>>,
    peer_index: HashMap<PeerId, HashSet<String>>,
    file_catalog: HashMap<String, FileEntry>,
}

impl AggregatorState {
    /// Apply one peer's fresh inventory, diffed against that peer's own
    /// previous contribution (not the global catalog).
    fn apply(&mut self, peer: &PeerId, files: &[FileEntry]) {
        let fresh: HashMap<String, FileEntry> = files
            .iter()
            .map(|f| (f.checksum.clone(), f.clone()))
            .collect();
        let previous = self.peer_index.entry(peer.clone()).or_default().clone();

        for (checksum, entry) in &fresh {
            if !previous.contains(checksum) {
                self.peer_index
                    .get_mut(peer)
                    .expect("just inserted above")
                    .insert(checksum.clone());
                self.file_index
                    .entry(checksum.clone())
                    .or_default()
                    .insert(peer.clone());
                self.file_catalog.entry(checksum.clone()).or_insert_with(|| entry.clone());
            }
        }

        for checksum in previous.iter() {
            if !fresh.contains_key(checksum) {
                if let Some(set) = self.peer_index.get_mut(peer) {
                    set.remove(checksum);
                }
                if let Some(set) = self.file_index.get_mut(checksum) {
                    set.remove(peer);
                    if set.is_empty() {
                        self.file_index.remove(checksum);
                        self.file_catalog.remove(checksum);
                    }
                }
            }
        }
    }
}

/// Owns a single-threaded event loop fed by an update channel of
/// `(RemoteInventory)` messages. Reads go through an `Arc<RwLock<..>>`
/// snapshot so they never block on the writer longer than one clone.
pub struct FileAggregator {
    state: Arc<RwLock<AggregatorState>>,
    sender: mpsc::Sender<RemoteInventory>,
    loop_handle: tokio::task::JoinHandle<()>,
}

impl FileAggregator {
    /// Spawn the event loop. Dropping the returned sender (via `stop`)
    /// terminates the loop once in-flight messages drain.
    pub fn spawn() -> Self {
        let state = Arc::new(RwLock::new(AggregatorState::default()));
        let (sender, mut receiver) = mpsc::channel::<RemoteInventory>(256);
        let loop_state = state.clone();
        let loop_handle = tokio::spawn(async move {
            while let Some(inventory) = receiver.recv().await {
                debug!(peer = %inventory.peer, files = inventory.files.len(), "aggregator applying inventory");
                let mut guard = loop_state.write().await;
                guard.apply(&inventory.peer, &inventory.files);
            }
        });
        FileAggregator {
            state,
            sender,
            loop_handle,
        }
    }

    /// Queue a peer's inventory for the event loop to apply.
    pub async fn push(&self, inventory: RemoteInventory) {
        let _ = self.sender.send(inventory).await;
    }

    /// Close the update channel and wait for in-flight messages to drain.
    pub async fn stop(self) {
        drop(self.sender);
        let _ = self.loop_handle.await;
    }

    pub async fn file_peers(&self, checksum: &str) -> Vec<PeerId> {
        self.state
            .read()
            .await
            .file_index
            .get(checksum)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn file_list(&self) -> Vec<FileEntry> {
        self.state.read().await.file_catalog.values().cloned().collect()
    }
}
