// src/workspace.rs
// Workspace manager (spec section 4.11): serializes workspace lifecycle
// events and composes every other module into the per-workspace runtime.

use crate::aggregator::FileAggregator;
use crate::config::NodeConfig;
use crate::crypto::{double_sha256_hex, parse_private_key};
use crate::error::{CoreError, IoError};
use crate::gossip::{self, GossipPublisher, GossipSubscriber};
use crate::lister::Lister;
use crate::model::{PeerId, WorkspaceCredentials, WorkspaceInfo, WorkspaceSecurity};
use crate::peer_finder::{PeerFinder, VerificationRpcHandler};
use crate::rendezvous::RendezvousClient;
use crate::storage::Storage;
use crate::transfer::{self, TransferClient, TransferRpcHandler, TransferServer};
use crate::transport::Transport;
use crate::verification::{VerificationService, CLIENT_VERIFICATION_PROTOCOL_ID};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What a caller offers to authenticate a `join_workspace` call.
pub enum JoinCredential {
    Password(String),
    PublicKey { public_key: String, private_key: String },
}

struct WorkspaceHandle {
    lister: Arc<Lister>,
    #[allow(dead_code)]
    aggregator: Arc<FileAggregator>,
    #[allow(dead_code)]
    verification: Arc<VerificationService>,
    peer_finder: Arc<PeerFinder>,
    #[allow(dead_code)]
    transfer_server: Arc<TransferServer>,
    publisher: Option<Arc<GossipPublisher>>,
    subscriber: Option<Arc<GossipSubscriber>>,
    sweep_cancel: watch::Sender<bool>,
    temp_dir: PathBuf,
}

/// Composes `Storage`/`Lister`/`FileAggregator`/`RendezvousClient`/
/// `VerificationService`/`PeerFinder`/gossip/transfer/`Transport` into one
/// node's running set of workspaces (spec 4.11, concurrency model in 5).
pub struct WorkspaceManager {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    rendezvous: Arc<RendezvousClient>,
    config: NodeConfig,
    workspaces: RwLock<HashMap<String, WorkspaceHandle>>,
    new_workspace_tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl WorkspaceManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        rendezvous: Arc<RendezvousClient>,
        config: NodeConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        let manager = Arc::new(WorkspaceManager {
            storage,
            transport,
            rendezvous,
            config,
            workspaces: RwLock::new(HashMap::new()),
            new_workspace_tx: Mutex::new(Some(tx)),
        });
        manager.clone().spawn_new_workspace_loop(rx);
        manager
    }

    fn spawn_new_workspace_loop(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        tokio::spawn(async move {
            while let Some(mnemonic) = rx.recv().await {
                if let Err(e) = self.initialize_workspace(&mnemonic).await {
                    warn!(mnemonic = %mnemonic, error = %e, "workspace initialization failed");
                }
            }
            debug!("new-workspace channel closed");
        });
    }

    /// Start every workspace this node already has persisted credentials
    /// for, e.g. on process startup.
    pub async fn start_existing_workspaces(&self) -> Result<(), CoreError> {
        for info in self.storage.list_workspaces().await? {
            if let Err(e) = self.initialize_workspace(&info.mnemonic).await {
                warn!(mnemonic = %info.mnemonic, error = %e, "failed to start persisted workspace");
            }
        }
        Ok(())
    }

    /// This node's backing store, for embedders that need to seed or
    /// inspect workspace descriptors directly (e.g. publishing a workspace
    /// a rendezvous node would otherwise mint).
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Resolve the workspace (via rendezvous if uncached), validate the
    /// join credential, persist descriptor + credentials, and signal
    /// initialization.
    pub async fn join_workspace(&self, mnemonic: &str, credential: JoinCredential) -> Result<(), CoreError> {
        let info = match self.storage.get_workspace(mnemonic).await? {
            Some(info) => info,
            None => self
                .rendezvous
                .get_workspace_info(mnemonic)
                .await?
                .ok_or_else(|| CoreError::UnknownWorkspace(mnemonic.to_string()))?,
        };

        let credentials = match (&info.security, &credential) {
            (WorkspaceSecurity::Password { hash }, JoinCredential::Password(password)) => {
                if double_sha256_hex(password) != *hash {
                    return Err(CoreError::InvalidCredentials);
                }
                WorkspaceCredentials {
                    mnemonic: mnemonic.to_string(),
                    public_key: None,
                    private_key: None,
                    password: Some(password.clone()),
                }
            }
            (WorkspaceSecurity::Contacts { .. }, JoinCredential::PublicKey { public_key, private_key }) => {
                if !info.is_permitted(public_key) {
                    return Err(CoreError::NotPermitted);
                }
                WorkspaceCredentials {
                    mnemonic: mnemonic.to_string(),
                    public_key: Some(public_key.clone()),
                    private_key: Some(private_key.clone()),
                    password: None,
                }
            }
            _ => return Err(CoreError::InvalidCredentials),
        };

        self.storage.put_workspace(&info).await?;
        self.storage.put_credentials(&credentials).await?;

        let tx = self.new_workspace_tx.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(mnemonic.to_string()).await;
        }
        Ok(())
    }

    async fn initialize_workspace(&self, mnemonic: &str) -> Result<(), CoreError> {
        if self.workspaces.read().await.contains_key(mnemonic) {
            return Ok(());
        }

        let info = self
            .storage
            .get_workspace(mnemonic)
            .await?
            .ok_or_else(|| CoreError::UnknownWorkspace(mnemonic.to_string()))?;
        let credentials = self
            .storage
            .get_credentials(mnemonic)
            .await?
            .ok_or(CoreError::InvalidCredentials)?;

        let workspace_dir = self.config.base_dir.join("files").join(slugify(&info.name));
        let share_dir = workspace_dir.join("share");
        let temp_dir = workspace_dir.join("temp");
        create_dir(&share_dir)?;
        create_dir(&temp_dir)?;

        let lister = Arc::new(Lister::with_fs_scanner(share_dir));
        let (sweep_cancel, _) = watch::channel(false);
        spawn_sweep_loop(lister.clone(), self.config.sweep_interval, sweep_cancel.subscribe());

        let verification = Arc::new(VerificationService::new(self.storage.clone()));
        self.transport
            .rpc()
            .register_handler(
                CLIENT_VERIFICATION_PROTOCOL_ID,
                Arc::new(VerificationRpcHandler { service: verification.clone() }),
            )
            .await;

        let transfer_server = Arc::new(TransferServer::new(self.storage.clone(), lister.clone(), verification.clone()));
        self.transport
            .rpc()
            .register_handler(
                transfer::FILE_SHARE_PROTOCOL_ID,
                Arc::new(TransferRpcHandler { server: transfer_server.clone() }),
            )
            .await;

        let peer_finder = PeerFinder::new(
            mnemonic.to_string(),
            self.transport.discovery(),
            self.transport.rpc(),
            self.storage.clone(),
        );
        peer_finder.clone().spawn();

        let aggregator = Arc::new(FileAggregator::spawn());

        let local_public_keys: Vec<String> = credentials.public_key.iter().cloned().collect();
        let owner = gossip::is_owner(&info, &local_public_keys);
        let roles = gossip::roles_for(info.workspace_type, owner);

        let publisher = if roles.publisher {
            let topic = self.transport.join_topic(mnemonic).await?;
            let publisher = GossipPublisher::new(lister.clone(), topic);
            publisher.clone().spawn();
            Some(publisher)
        } else {
            None
        };
        let subscriber = if roles.subscriber {
            let topic = self.transport.join_topic(mnemonic).await?;
            let subscriber = GossipSubscriber::new(self.transport.discovery().self_id(), topic, aggregator.clone());
            subscriber.clone().spawn();
            Some(subscriber)
        } else {
            None
        };

        self.workspaces.write().await.insert(
            mnemonic.to_string(),
            WorkspaceHandle {
                lister,
                aggregator,
                verification,
                peer_finder,
                transfer_server,
                publisher,
                subscriber,
                sweep_cancel,
                temp_dir,
            },
        );
        info!(mnemonic = %mnemonic, publisher = roles.publisher, subscriber = roles.subscriber, "workspace initialized");
        Ok(())
    }

    /// Cancel all per-workspace loops, then remove it from the tracked map
    /// — stop happens-before the manager considers the workspace torn down.
    pub async fn stop_workspace(&self, mnemonic: &str) -> Result<(), CoreError> {
        let workspaces = self.workspaces.read().await;
        let handle = workspaces
            .get(mnemonic)
            .ok_or_else(|| CoreError::UnknownWorkspace(mnemonic.to_string()))?;

        let _ = handle.sweep_cancel.send(true);
        handle.peer_finder.stop();
        if let Some(publisher) = &handle.publisher {
            publisher.stop();
        }
        if let Some(subscriber) = &handle.subscriber {
            subscriber.stop();
        }
        drop(workspaces);

        self.workspaces.write().await.remove(mnemonic);
        debug!(mnemonic = %mnemonic, "workspace stopped");
        Ok(())
    }

    /// Stop every running workspace, then close the new-workspace channel.
    pub async fn shutdown(&self) {
        let mnemonics: Vec<String> = self.workspaces.read().await.keys().cloned().collect();
        for mnemonic in mnemonics {
            if let Err(e) = self.stop_workspace(&mnemonic).await {
                warn!(mnemonic = %mnemonic, error = %e, "failed to stop workspace during shutdown");
            }
        }
        self.new_workspace_tx.lock().await.take();
    }

    /// Request a file by checksum from `peer`, decrypt and verify it, and
    /// write the result into the workspace's `temp` directory. The
    /// client-side half of spec 4.10.
    pub async fn download_file(&self, mnemonic: &str, peer: PeerId, checksum: &str) -> Result<PathBuf, CoreError> {
        let credentials = self
            .storage
            .get_credentials(mnemonic)
            .await?
            .ok_or(CoreError::InvalidCredentials)?;

        let rpc = self.transport.rpc();
        let request = transfer::RequestFileRequest {
            mnemonic: mnemonic.to_string(),
            file_checksum: checksum.to_string(),
            public_key: credentials.public_key.clone(),
        };
        let metadata = transfer::request_file_over_rpc(rpc.as_ref(), &peer, request).await?;
        let chunks = transfer::download_file_over_rpc(rpc.as_ref(), &peer, &metadata.request_id).await?;

        let private_key = credentials
            .private_key
            .as_deref()
            .map(parse_private_key)
            .transpose()?;
        let keys = TransferClient::derive_keys(&metadata, credentials.password.as_deref(), private_key.as_ref())?;
        let plaintext = TransferClient::decode_stream(&chunks, &keys.0, &keys.1, &metadata.iv)?;

        let temp_dir = self
            .workspaces
            .read()
            .await
            .get(mnemonic)
            .map(|handle| handle.temp_dir.clone())
            .ok_or_else(|| CoreError::UnknownWorkspace(mnemonic.to_string()))?;
        TransferClient::new(temp_dir).write_to_temp(&metadata.file_name, &plaintext).await
    }

    /// Snapshot of one workspace's currently-shared files, for UI/admin
    /// surfaces layered on top of this crate.
    pub async fn available_files(&self, mnemonic: &str) -> Option<Vec<crate::model::FileEntry>> {
        let workspaces = self.workspaces.read().await;
        let handle = workspaces.get(mnemonic)?;
        Some(handle.lister.available_files().await)
    }
}

fn create_dir(dir: &std::path::Path) -> Result<(), CoreError> {
    std::fs::create_dir_all(dir).map_err(|source| {
        CoreError::Io(IoError::Fs {
            path: dir.display().to_string(),
            source,
        })
    })
}

fn spawn_sweep_loop(lister: Arc<Lister>, interval: Duration, mut cancelled: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    lister.sweep().await;
                }
                _ = cancelled.changed() => {
                    break;
                }
            }
        }
    });
}

/// Lowercase, non-alphanumeric-to-hyphen slug for a workspace directory name.
fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
