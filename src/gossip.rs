// src/gossip.rs
// Gossip publisher/subscriber (spec sections 4.8-4.9): broadcasting and
// ingesting file inventories over a workspace's joined topic.

use crate::aggregator::{FileAggregator, RemoteInventory};
use crate::lister::Lister;
use crate::model::{FileEntry, PeerId, WorkspaceInfo, WorkspaceType};
use crate::transport::GossipTopic;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

pub const GOSSIP_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct InventoryMessage {
    files: Vec<FileEntry>,
}

/// Which roles (publisher, subscriber) a peer should run for a workspace,
/// derived from `workspace_type` and whether it owns the workspace (spec
/// 4.9's role-gating table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    pub publisher: bool,
    pub subscriber: bool,
}

pub fn roles_for(workspace_type: WorkspaceType, is_owner: bool) -> Roles {
    match (workspace_type, is_owner) {
        (WorkspaceType::SendOnly, true) => Roles { publisher: false, subscriber: true },
        (WorkspaceType::SendOnly, false) => Roles { publisher: true, subscriber: false },
        (WorkspaceType::ReceiveOnly, true) => Roles { publisher: true, subscriber: false },
        (WorkspaceType::ReceiveOnly, false) => Roles { publisher: false, subscriber: true },
        (WorkspaceType::SendReceive, _) => Roles { publisher: true, subscriber: true },
    }
}

/// True if any of `local_public_keys` is one of the workspace's owner keys.
pub fn is_owner(workspace: &WorkspaceInfo, local_public_keys: &[String]) -> bool {
    local_public_keys.iter().any(|k| workspace.is_owner(k))
}

/// Every 5s, publishes the lister's current snapshot to the workspace's
/// gossip topic if non-empty. Closes the topic exactly once on stop.
pub struct GossipPublisher {
    lister: Arc<Lister>,
    topic: Mutex<Box<dyn GossipTopic>>,
    cancel: watch::Sender<bool>,
}

impl GossipPublisher {
    pub fn new(lister: Arc<Lister>, topic: Box<dyn GossipTopic>) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(GossipPublisher {
            lister,
            topic: Mutex::new(topic),
            cancel,
        })
    }

    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn spawn(self: Arc<Self>) {
        let mut cancelled = self.cancel.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GOSSIP_PUBLISH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.publish_once().await;
                    }
                    _ = cancelled.changed() => {
                        break;
                    }
                }
            }
            if let Err(e) = self.topic.lock().await.close().await {
                warn!(error = %e, "failed to close gossip topic on publisher stop");
            }
        });
    }

    async fn publish_once(&self) {
        let files = self.lister.available_files().await;
        if files.is_empty() {
            return;
        }
        let message = InventoryMessage { files };
        let payload = match serde_json::to_vec(&message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize inventory");
                return;
            }
        };
        if let Err(e) = self.topic.lock().await.publish(payload).await {
            warn!(error = %e, "failed to publish inventory");
        }
    }
}

/// Feeds every remote inventory seen on the topic into a `FileAggregator`,
/// dropping self-authored messages and tolerating malformed ones.
pub struct GossipSubscriber {
    self_id: PeerId,
    topic: Mutex<Box<dyn GossipTopic>>,
    aggregator: Arc<FileAggregator>,
    cancel: watch::Sender<bool>,
}

impl GossipSubscriber {
    pub fn new(self_id: PeerId, topic: Box<dyn GossipTopic>, aggregator: Arc<FileAggregator>) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(GossipSubscriber {
            self_id,
            topic: Mutex::new(topic),
            aggregator,
            cancel,
        })
    }

    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn spawn(self: Arc<Self>) {
        let mut cancelled = self.cancel.subscribe();
        tokio::spawn(async move {
            loop {
                let mut topic = self.topic.lock().await;
                let result = tokio::select! {
                    result = topic.next_message() => Some(result),
                    _ = cancelled.changed() => None,
                };
                drop(topic);
                match result {
                    Some(Ok((sender, payload))) => self.handle_message(sender, payload).await,
                    Some(Err(e)) => {
                        debug!(error = %e, "gossip subscription ended");
                        break;
                    }
                    None => break,
                }
            }
        });
    }

    async fn handle_message(&self, sender: PeerId, payload: Vec<u8>) {
        if sender == self.self_id {
            return;
        }
        let message: InventoryMessage = match serde_json::from_slice(&payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(sender = %sender, error = %e, "dropping malformed inventory");
                return;
            }
        };
        self.aggregator
            .push(RemoteInventory {
                peer: sender,
                files: message.files,
            })
            .await;
    }
}
