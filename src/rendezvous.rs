// src/rendezvous.rs
// Rendezvous client (spec section 4.5): fetch/publish workspace descriptors
// over the `/workspace-info-proto/0.1` RPC stream.

use crate::error::TransportError;
use crate::model::{PeerId, WorkspaceInfo};
use crate::transport::RpcTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub const WORKSPACE_INFO_PROTOCOL_ID: &str = "/workspace-info-proto/0.1";

#[derive(Debug, Serialize, Deserialize)]
enum RendezvousRequest {
    GetWorkspaceInfo { mnemonic: String },
    CreateWorkspace { descriptor_without_mnemonic: WorkspaceInfo },
}

#[derive(Debug, Serialize, Deserialize)]
enum RendezvousResponse {
    WorkspaceInfo(WorkspaceInfo),
    NotFound,
    Error(String),
}

/// RPC client over one peer-to-peer stream to the first reachable
/// rendezvous of a cached, ordered list.
pub struct RendezvousClient {
    rpc: Arc<dyn RpcTransport>,
    rendezvous_ids: RwLock<Vec<PeerId>>,
}

impl RendezvousClient {
    pub fn new(rpc: Arc<dyn RpcTransport>, rendezvous_ids: Vec<PeerId>) -> Self {
        RendezvousClient {
            rpc,
            rendezvous_ids: RwLock::new(rendezvous_ids),
        }
    }

    /// Scans the cached rendezvous ids in order, issuing `request` to each
    /// until one answers at the transport level; unreachable entries are
    /// dropped from the cache permanently as the scan passes them (spec
    /// 4.5: "removing disconnected entries from the cache as it scans").
    async fn call_first_reachable(&self, request: &RendezvousRequest) -> Result<RendezvousResponse, TransportError> {
        let candidates = self.rendezvous_ids.read().await.clone();
        let mut still_reachable = Vec::new();
        let mut answer = None;
        let payload = serde_json::to_vec(request).map_err(|e| TransportError::Stream(e.to_string()))?;

        for id in candidates {
            if answer.is_some() {
                still_reachable.push(id);
                continue;
            }
            match self.rpc.call(&id, WORKSPACE_INFO_PROTOCOL_ID, payload.clone()).await {
                Ok(raw) => {
                    still_reachable.push(id);
                    let response: RendezvousResponse =
                        serde_json::from_slice(&raw).map_err(|e| TransportError::Stream(e.to_string()))?;
                    answer = Some(response);
                }
                Err(e) => {
                    warn!(peer = %id, error = %e, "rendezvous unreachable, dropping from cache");
                }
            }
        }
        *self.rendezvous_ids.write().await = still_reachable;
        answer.ok_or(TransportError::NoReachableRendezvous)
    }

    /// Returns the first currently-connected rendezvous id, probing each
    /// candidate in cache order and pruning any that don't answer at the
    /// transport level -- the same scan-and-prune shape as
    /// `call_first_reachable`, but the probe's payload is discarded; any
    /// answer (including `NotFound`) proves the peer is alive.
    pub async fn find_best_rendezvous(&self) -> Option<PeerId> {
        let candidates = self.rendezvous_ids.read().await.clone();
        let probe = RendezvousRequest::GetWorkspaceInfo { mnemonic: String::new() };
        let payload = match serde_json::to_vec(&probe) {
            Ok(p) => p,
            Err(_) => return None,
        };

        let mut still_reachable = Vec::new();
        let mut best = None;
        for id in candidates {
            if best.is_some() {
                still_reachable.push(id);
                continue;
            }
            match self.rpc.call(&id, WORKSPACE_INFO_PROTOCOL_ID, payload.clone()).await {
                Ok(_) => {
                    still_reachable.push(id.clone());
                    best = Some(id);
                }
                Err(e) => {
                    warn!(peer = %id, error = %e, "rendezvous unreachable, dropping from cache");
                }
            }
        }
        *self.rendezvous_ids.write().await = still_reachable;
        best
    }

    pub async fn get_workspace_info(&self, mnemonic: &str) -> Result<Option<WorkspaceInfo>, TransportError> {
        let request = RendezvousRequest::GetWorkspaceInfo {
            mnemonic: mnemonic.to_string(),
        };
        match self.call_first_reachable(&request).await? {
            RendezvousResponse::WorkspaceInfo(info) => Ok(Some(info)),
            RendezvousResponse::NotFound => Ok(None),
            RendezvousResponse::Error(msg) => Err(TransportError::Stream(msg)),
        }
    }

    pub async fn create_workspace(&self, descriptor_without_mnemonic: WorkspaceInfo) -> Result<WorkspaceInfo, TransportError> {
        let request = RendezvousRequest::CreateWorkspace {
            descriptor_without_mnemonic,
        };
        match self.call_first_reachable(&request).await? {
            RendezvousResponse::WorkspaceInfo(info) => Ok(info),
            RendezvousResponse::NotFound => Err(TransportError::Stream("rendezvous returned not-found for create".into())),
            RendezvousResponse::Error(msg) => Err(TransportError::Stream(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WorkspaceSecurity, WorkspaceType};
    use crate::transport::{loopback::LoopbackNetwork, RpcHandler, RpcTransport, Transport};
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn sample_workspace(mnemonic: &str) -> WorkspaceInfo {
        WorkspaceInfo {
            mnemonic: mnemonic.to_string(),
            name: "demo".into(),
            workspace_type: WorkspaceType::SendReceive,
            owner_public_keys: HashSet::new(),
            security: WorkspaceSecurity::Password { hash: "deadbeef".into() },
        }
    }

    struct FakeRendezvousHandler {
        workspace: WorkspaceInfo,
    }

    #[async_trait]
    impl RpcHandler for FakeRendezvousHandler {
        async fn handle(&self, _caller: PeerId, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            let req: RendezvousRequest =
                serde_json::from_slice(&request).map_err(|e| TransportError::Stream(e.to_string()))?;
            let response = match req {
                RendezvousRequest::GetWorkspaceInfo { mnemonic } if mnemonic == self.workspace.mnemonic => {
                    RendezvousResponse::WorkspaceInfo(self.workspace.clone())
                }
                RendezvousRequest::GetWorkspaceInfo { .. } => RendezvousResponse::NotFound,
                RendezvousRequest::CreateWorkspace { .. } => RendezvousResponse::WorkspaceInfo(self.workspace.clone()),
            };
            serde_json::to_vec(&response).map_err(|e| TransportError::Stream(e.to_string()))
        }
    }

    #[tokio::test]
    async fn fetches_workspace_from_first_reachable_rendezvous() {
        let network = LoopbackNetwork::new();
        let r1 = network.peer(PeerId::from("r1"));
        let client_transport = network.peer(PeerId::from("client"));
        let ws = sample_workspace("alpha bravo charlie");
        r1.register_handler(
            WORKSPACE_INFO_PROTOCOL_ID,
            Arc::new(FakeRendezvousHandler { workspace: ws.clone() }),
        )
        .await;

        let client = RendezvousClient::new(Transport::rpc(&client_transport), vec![PeerId::from("r1")]);
        let fetched = client.get_workspace_info(&ws.mnemonic).await.unwrap().unwrap();
        assert_eq!(fetched.mnemonic, ws.mnemonic);
    }

    #[tokio::test]
    async fn s6_rendezvous_failover_drops_unreachable_entry() {
        let network = LoopbackNetwork::new();
        let r2 = network.peer(PeerId::from("r2"));
        let client_transport = network.peer(PeerId::from("client"));
        let ws = sample_workspace("delta echo foxtrot");
        r2.register_handler(
            WORKSPACE_INFO_PROTOCOL_ID,
            Arc::new(FakeRendezvousHandler { workspace: ws.clone() }),
        )
        .await;

        // r1 never registers a handler, so a call to it returns a Stream
        // error from the loopback network's "no handler" path; that's
        // already treated as unreachable (handled above as a dead peer) --
        // here r1 simply isn't addressable at all, which is the stronger
        // form of the same failure this client must route around.
        let client = RendezvousClient::new(
            Transport::rpc(&client_transport),
            vec![PeerId::from("r1"), PeerId::from("r2")],
        );
        let fetched = client.get_workspace_info(&ws.mnemonic).await.unwrap().unwrap();
        assert_eq!(fetched.mnemonic, ws.mnemonic);
    }

    #[tokio::test]
    async fn find_best_rendezvous_prunes_dead_entries_and_returns_first_live_one() {
        let network = LoopbackNetwork::new();
        let r2 = network.peer(PeerId::from("r2"));
        let client_transport = network.peer(PeerId::from("client"));
        let ws = sample_workspace("kilo lima mike");
        r2.register_handler(
            WORKSPACE_INFO_PROTOCOL_ID,
            Arc::new(FakeRendezvousHandler { workspace: ws }),
        )
        .await;

        let client = RendezvousClient::new(
            Transport::rpc(&client_transport),
            vec![PeerId::from("r1"), PeerId::from("r2")],
        );

        let best = client.find_best_rendezvous().await;
        assert_eq!(best, Some(PeerId::from("r2")));
        // r1 never answered, so it must have been dropped from the cache.
        assert_eq!(*client.rendezvous_ids.read().await, vec![PeerId::from("r2")]);
    }
}
