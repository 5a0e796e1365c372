// src/peer_finder.rs
// Peer finder (spec section 4.7): 10s-cadence discovery/handshake loop
// maintaining the pending and verified peer sets for one workspace.

use crate::challenge;
use crate::crypto::parse_private_key;
use crate::error::CoreError;
use crate::model::{PeerId, WorkspaceSecurity};
use crate::storage::Storage;
use crate::transport::{PeerDiscovery, RpcTransport};
use crate::verification::{
    VerificationRequest, VerificationResponse, CLIENT_VERIFICATION_PROTOCOL_ID,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const PEER_FINDER_TICK: Duration = Duration::from_secs(10);
pub const ADVERTISE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
enum VerificationWireRequest {
    Begin(VerificationRequest),
    Finish(challenge::Solution),
}

#[derive(Debug, Serialize, Deserialize)]
enum VerificationWireResponse {
    Challenge(challenge::Challenge),
    Finished(VerificationResponse),
    Error(String),
}

/// Per-workspace discovery/handshake loop (spec 4.7). Pending/verified
/// tracking lives here; `VerificationService` tracks server-side verified
/// peers, this tracks the client's own view of who it has successfully
/// handshaken outbound.
pub struct PeerFinder {
    mnemonic: String,
    self_id: PeerId,
    discovery: Arc<dyn PeerDiscovery>,
    rpc: Arc<dyn RpcTransport>,
    storage: Arc<dyn Storage>,
    pending: RwLock<HashSet<PeerId>>,
    verified: RwLock<HashSet<PeerId>>,
    cancel: watch::Sender<bool>,
}

impl PeerFinder {
    pub fn new(
        mnemonic: String,
        discovery: Arc<dyn PeerDiscovery>,
        rpc: Arc<dyn RpcTransport>,
        storage: Arc<dyn Storage>,
    ) -> Arc<Self> {
        let self_id = discovery.self_id();
        let (cancel, _) = watch::channel(false);
        Arc::new(PeerFinder {
            mnemonic,
            self_id,
            discovery,
            rpc,
            storage,
            pending: RwLock::new(HashSet::new()),
            verified: RwLock::new(HashSet::new()),
            cancel,
        })
    }

    pub async fn verified_peers(&self) -> Vec<PeerId> {
        self.verified.read().await.iter().cloned().collect()
    }

    /// Signal the tick loop and any in-flight handshake tasks to stop; each
    /// honors this on its next await point and releases its pending flag.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Spawn the 10s-cadence tick loop. Stops on [`PeerFinder::stop`].
    pub fn spawn(self: Arc<Self>) {
        let mut cancelled = self.cancel.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PEER_FINDER_TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.clone().tick().await;
                    }
                    _ = cancelled.changed() => {
                        debug!(mnemonic = %self.mnemonic, "peer finder stopped");
                        break;
                    }
                }
            }
        });
    }

    async fn tick(self: Arc<Self>) {
        if let Err(e) = self.discovery.advertise(&self.mnemonic, ADVERTISE_TTL).await {
            warn!(mnemonic = %self.mnemonic, error = %e, "advertise failed");
        }
        let providers = match self.discovery.find_providers(&self.mnemonic).await {
            Ok(p) => p,
            Err(e) => {
                warn!(mnemonic = %self.mnemonic, error = %e, "find_providers failed");
                return;
            }
        };

        for peer in providers {
            if peer == self.self_id {
                continue;
            }
            if self.verified.read().await.contains(&peer) {
                continue;
            }
            {
                let mut pending = self.pending.write().await;
                if pending.contains(&peer) {
                    continue;
                }
                pending.insert(peer.clone());
            }
            let this = self.clone();
            let mut cancelled = self.cancel.subscribe();
            tokio::spawn(async move {
                let result = tokio::select! {
                    r = this.handshake(peer.clone()) => r,
                    _ = cancelled.changed() => {
                        debug!(peer = %peer, "handshake cancelled");
                        Ok(())
                    }
                };
                this.pending.write().await.remove(&peer);
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "outbound handshake failed");
                }
            });
        }
    }

    async fn handshake(&self, peer: PeerId) -> Result<(), CoreError> {
        let workspace = self
            .storage
            .get_workspace(&self.mnemonic)
            .await?
            .ok_or_else(|| CoreError::UnknownWorkspace(self.mnemonic.clone()))?;
        let credentials = self
            .storage
            .get_credentials(&self.mnemonic)
            .await?
            .ok_or(CoreError::InvalidCredentials)?;

        let begin_request = VerificationRequest {
            workspace_mnemonic: self.mnemonic.clone(),
            public_key: match &workspace.security {
                WorkspaceSecurity::Contacts { .. } => credentials.public_key.clone(),
                WorkspaceSecurity::Password { .. } => None,
            },
        };

        let raw = self
            .rpc
            .call(
                &peer,
                CLIENT_VERIFICATION_PROTOCOL_ID,
                serde_json::to_vec(&VerificationWireRequest::Begin(begin_request))
                    .map_err(|e| CoreError::Storage(crate::error::StorageError::Backend(e.to_string())))?,
            )
            .await?;
        let challenge = match serde_json::from_slice::<VerificationWireResponse>(&raw) {
            Ok(VerificationWireResponse::Challenge(c)) => c,
            Ok(VerificationWireResponse::Error(msg)) => return Err(CoreError::Transport(crate::error::TransportError::Stream(msg))),
            _ => return Err(CoreError::Transport(crate::error::TransportError::Stream("malformed begin-verification reply".into()))),
        };

        let solution = match &workspace.security {
            WorkspaceSecurity::Password { .. } => {
                let password = credentials.password.as_deref().ok_or(CoreError::InvalidCredentials)?;
                challenge::solve_password_challenge(&challenge, password)?
            }
            WorkspaceSecurity::Contacts { .. } => {
                let pem = credentials.private_key.as_deref().ok_or(CoreError::InvalidCredentials)?;
                let private_key = parse_private_key(pem)?;
                challenge::solve_public_key_challenge(&challenge, &private_key)?
            }
        };

        let raw = self
            .rpc
            .call(
                &peer,
                CLIENT_VERIFICATION_PROTOCOL_ID,
                serde_json::to_vec(&VerificationWireRequest::Finish(solution))
                    .map_err(|e| CoreError::Storage(crate::error::StorageError::Backend(e.to_string())))?,
            )
            .await?;
        match serde_json::from_slice::<VerificationWireResponse>(&raw) {
            Ok(VerificationWireResponse::Finished(resp)) if resp.confirmed => {
                self.verified.write().await.insert(peer);
                Ok(())
            }
            Ok(VerificationWireResponse::Finished(_)) => Err(CoreError::InvalidSolution),
            Ok(VerificationWireResponse::Error(msg)) => Err(CoreError::Transport(crate::error::TransportError::Stream(msg))),
            _ => Err(CoreError::Transport(crate::error::TransportError::Stream("malformed finish-verification reply".into()))),
        }
    }
}

/// Server-side RPC handler wiring `VerificationService` onto the transport's
/// `/client-verification-proto/0.1` protocol id.
pub struct VerificationRpcHandler {
    pub service: Arc<crate::verification::VerificationService>,
}

#[async_trait::async_trait]
impl crate::transport::RpcHandler for VerificationRpcHandler {
    async fn handle(&self, caller: PeerId, request: Vec<u8>) -> Result<Vec<u8>, crate::error::TransportError> {
        let wire: VerificationWireRequest =
            serde_json::from_slice(&request).map_err(|e| crate::error::TransportError::Stream(e.to_string()))?;
        let response = match wire {
            VerificationWireRequest::Begin(req) => match self.service.begin_verification(req).await {
                Ok(challenge) => VerificationWireResponse::Challenge(challenge),
                Err(e) => VerificationWireResponse::Error(e.to_string()),
            },
            VerificationWireRequest::Finish(solution) => match self.service.finish_verification(solution, caller).await {
                Ok(resp) => VerificationWireResponse::Finished(resp),
                Err(e) => VerificationWireResponse::Error(e.to_string()),
            },
        };
        serde_json::to_vec(&response).map_err(|e| crate::error::TransportError::Stream(e.to_string()))
    }
}
