// tests/scenarios.rs
// End-to-end scenarios (spec section 8) driven through `WorkspaceManager`
// across two peers on the loopback transport. Lower-level invariants
// (challenge roundtrips, stale timestamps, chunk integrity, rendezvous
// failover, aggregator bookkeeping) already have focused unit tests next to
// the module that owns them; these exercise the full composed pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use workspace_mesh::{
    InMemoryStorage, JoinCredential, NodeConfig, PeerId, RendezvousClient, Storage, Transport,
    WorkspaceInfo, WorkspaceManager, WorkspaceSecurity, WorkspaceType,
};
use workspace_mesh::transport::loopback::LoopbackNetwork;

fn node(network: &LoopbackNetwork, peer: &str, base: &str) -> Arc<WorkspaceManager> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let concrete = network.peer(PeerId::from(peer));
    let rendezvous = Arc::new(RendezvousClient::new(Transport::rpc(&concrete), Vec::new()));
    let transport: Arc<dyn Transport> = Arc::new(concrete);
    let config = NodeConfig::new(PathBuf::from(base));
    WorkspaceManager::new(storage, transport, rendezvous, config)
}

/// Advance the paused clock in small steps, yielding between each so every
/// spawned loop gets a chance to run at each tick boundary.
async fn settle(total: Duration, step: Duration) {
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        tokio::time::advance(step).await;
        tokio::task::yield_now().await;
        elapsed += step;
    }
}

fn password_workspace(mnemonic: &str, password: &str) -> WorkspaceInfo {
    WorkspaceInfo {
        mnemonic: mnemonic.to_string(),
        name: "design docs".to_string(),
        workspace_type: WorkspaceType::SendReceive,
        owner_public_keys: Default::default(),
        security: WorkspaceSecurity::Password {
            hash: workspace_mesh::crypto::double_sha256_hex(password),
        },
    }
}

/// S1 - password join, two peers, single file transfer.
#[tokio::test(start_paused = true)]
async fn s1_password_join_propagates_inventory_and_downloads_file() {
    let mnemonic = "alpha bravo charlie delta";
    let password = "hunter2";
    let network = LoopbackNetwork::new();

    let node_a = node(&network, "peerA", "/tmp/workspace-mesh-scenarios-s1-a");
    let node_b = node(&network, "peerB", "/tmp/workspace-mesh-scenarios-s1-b");

    let info = password_workspace(mnemonic, password);
    node_a.storage().put_workspace(&info).await.unwrap();
    node_b.storage().put_workspace(&info).await.unwrap();

    node_a
        .join_workspace(mnemonic, JoinCredential::Password(password.to_string()))
        .await
        .unwrap();
    node_b
        .join_workspace(mnemonic, JoinCredential::Password(password.to_string()))
        .await
        .unwrap();

    settle(Duration::from_secs(1), Duration::from_millis(100)).await;

    let share_dir = PathBuf::from("/tmp/workspace-mesh-scenarios-s1-a/files/design-docs/share");
    std::fs::create_dir_all(&share_dir).unwrap();
    let contents = vec![0x5au8; 100 * 1024];
    std::fs::write(share_dir.join("report.bin"), &contents).unwrap();

    // Two 10s peer-finder ticks (handshake) and a couple of 5s gossip ticks.
    settle(Duration::from_secs(25), Duration::from_secs(1)).await;

    let checksum = workspace_mesh::crypto::sha256_hex(&contents);
    let downloaded = node_b
        .download_file(mnemonic, PeerId::from("peerA"), &checksum)
        .await
        .expect("B should be able to download the file A is sharing");

    assert_eq!(std::fs::read(&downloaded).unwrap(), contents);
}

/// S2 - wrong password is rejected at join time, before any handshake is
/// ever attempted (a node cannot join a workspace it doesn't hold the
/// credential for).
#[tokio::test(start_paused = true)]
async fn s2_wrong_password_rejected_at_join() {
    let mnemonic = "echo foxtrot golf hotel";
    let network = LoopbackNetwork::new();

    let node_a = node(&network, "peerA", "/tmp/workspace-mesh-scenarios-s2-a");
    let node_b = node(&network, "peerB", "/tmp/workspace-mesh-scenarios-s2-b");

    let info = password_workspace(mnemonic, "hunter2");
    node_a.storage().put_workspace(&info).await.unwrap();
    node_b.storage().put_workspace(&info).await.unwrap();

    node_a
        .join_workspace(mnemonic, JoinCredential::Password("hunter2".to_string()))
        .await
        .unwrap();

    let err = node_b
        .join_workspace(mnemonic, JoinCredential::Password("letmein".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, workspace_mesh::CoreError::InvalidCredentials));

    // B was never admitted, so it has no verified path to A's files.
    settle(Duration::from_secs(25), Duration::from_secs(1)).await;
    assert!(node_b.available_files(mnemonic).await.is_none());
}
