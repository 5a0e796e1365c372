// src/transfer.rs
// File transfer service (spec section 4.10): two-step RPC negotiating
// per-download keying material, then a chunked AES-CTR+HMAC stream.

use crate::crypto::{self, AES_IV_LEN, AES_KEY_LEN, HMAC_KEY_LEN};
use crate::error::{CoreError, CryptoError, IoError, TransportError};
use crate::lister::Lister;
use crate::model::{PeerId, WorkspaceInfo, WorkspaceSecurity};
use crate::storage::Storage;
use crate::transport::{RpcHandler, RpcTransport};
use crate::verification::VerificationService;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const FILE_SHARE_PROTOCOL_ID: &str = "/file-share-proto/0.1";
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFileRequest {
    pub mnemonic: String,
    pub file_checksum: String,
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDownloadMetadata {
    pub request_id: String,
    pub iv: [u8; AES_IV_LEN],
    pub file_name: String,
    pub salt: Option<[u8; 32]>,
    pub encrypted_aes_key: Option<Vec<u8>>,
    pub encrypted_hmac_key: Option<Vec<u8>>,
    pub mnemonic: String,
    pub file_checksum: String,
}

struct PendingDownload {
    peer_id: PeerId,
    checksum: String,
    iv: [u8; AES_IV_LEN],
    aes_key: [u8; AES_KEY_LEN],
    hmac_key: [u8; HMAC_KEY_LEN],
}

/// Server side: answers `RequestFile`/`DownloadFile` for one node's files.
pub struct TransferServer {
    storage: Arc<dyn Storage>,
    lister: Arc<Lister>,
    verification: Arc<VerificationService>,
    pending: Mutex<HashMap<String, PendingDownload>>,
}

impl TransferServer {
    pub fn new(storage: Arc<dyn Storage>, lister: Arc<Lister>, verification: Arc<VerificationService>) -> Self {
        TransferServer {
            storage,
            lister,
            verification,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn request_file(
        &self,
        caller: PeerId,
        request: RequestFileRequest,
    ) -> Result<FileDownloadMetadata, CoreError> {
        if !self.verification.is_verified(&request.mnemonic, &caller).await {
            return Err(CoreError::NotPermitted);
        }
        let workspace = self
            .storage
            .get_workspace(&request.mnemonic)
            .await?
            .ok_or_else(|| CoreError::UnknownWorkspace(request.mnemonic.clone()))?;
        let file_entry = self
            .lister
            .file_info(&request.file_checksum)
            .await
            .ok_or(CoreError::UnknownRequest)?;
        let credentials = self
            .storage
            .get_credentials(&request.mnemonic)
            .await?
            .ok_or(CoreError::InvalidCredentials)?;

        let iv = random_iv();
        let (aes_key, hmac_key, salt, encrypted_aes_key, encrypted_hmac_key) = match &workspace.security {
            WorkspaceSecurity::Password { .. } => {
                let password = credentials.password.as_deref().ok_or(CoreError::InvalidCredentials)?;
                let salt = random_salt();
                let derived = crypto::pbkdf2_derive(password, &salt);
                let (aes_key, hmac_key) = crypto::split_derived_key(&derived);
                (aes_key, hmac_key, Some(salt), None, None)
            }
            WorkspaceSecurity::Contacts { .. } => {
                let requester_key = request.public_key.as_deref().ok_or(CoreError::NotPermitted)?;
                let public_key = crypto::parse_public_key(requester_key)?;
                // Random passphrase in place of a real password: the salt here
                // only serves PBKDF2's API, not key derivation from a secret.
                let random_passphrase = Uuid::new_v4().to_string();
                let salt = random_salt();
                let derived = crypto::pbkdf2_derive(&random_passphrase, &salt);
                let (aes_key, hmac_key) = crypto::split_derived_key(&derived);
                let encrypted_aes_key = crypto::rsa_oaep_encrypt(&public_key, &aes_key)?;
                let encrypted_hmac_key = crypto::rsa_oaep_encrypt(&public_key, &hmac_key)?;
                (aes_key, hmac_key, None, Some(encrypted_aes_key), Some(encrypted_hmac_key))
            }
        };

        let request_id = Uuid::new_v4().to_string();
        self.pending.lock().await.insert(
            request_id.clone(),
            PendingDownload {
                peer_id: caller,
                checksum: request.file_checksum.clone(),
                iv,
                aes_key,
                hmac_key,
            },
        );

        Ok(FileDownloadMetadata {
            request_id,
            iv,
            file_name: format!("{}.{}", file_entry.name, file_entry.extension),
            salt,
            encrypted_aes_key,
            encrypted_hmac_key,
            mnemonic: workspace.mnemonic,
            file_checksum: file_entry.checksum,
        })
    }

    /// Stream the requested file's ciphertext chunks followed by the
    /// `iv || hmac_tag` trailer chunk.
    pub async fn download_file(&self, caller: PeerId, request_id: &str) -> Result<Vec<Vec<u8>>, CoreError> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(request_id)
            .ok_or(CoreError::UnknownRequest)?;
        if pending.peer_id != caller {
            return Err(CoreError::NotPermitted);
        }

        let path = self
            .lister
            .file_path(&pending.checksum)
            .await
            .ok_or(CoreError::UnknownRequest)?;
        let data = std::fs::read(&path).map_err(|source| {
            CoreError::Io(IoError::Fs {
                path: path.display().to_string(),
                source,
            })
        })?;

        let mut chunks = Vec::new();
        let mut hmac = crypto::HmacAccumulator::new(&pending.hmac_key);
        for raw_chunk in data.chunks(CHUNK_SIZE) {
            let mut ciphertext = raw_chunk.to_vec();
            crypto::aes_ctr_apply(&pending.aes_key, &pending.iv, &mut ciphertext);
            hmac.update(&ciphertext);
            chunks.push(ciphertext);
        }
        hmac.update(&pending.iv);
        let tag = hmac.finalize();
        let mut trailer = pending.iv.to_vec();
        trailer.extend_from_slice(&tag);
        chunks.push(trailer);
        Ok(chunks)
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum FileShareWireRequest {
    RequestFile(RequestFileRequest),
    DownloadFile(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum FileShareWireResponse {
    Metadata(FileDownloadMetadata),
    Chunks(Vec<Vec<u8>>),
    Error(String),
}

/// Server-side RPC handler wiring `TransferServer` onto the transport's
/// `/file-share-proto/0.1` protocol id.
pub struct TransferRpcHandler {
    pub server: Arc<TransferServer>,
}

#[async_trait::async_trait]
impl RpcHandler for TransferRpcHandler {
    async fn handle(&self, caller: PeerId, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let wire: FileShareWireRequest =
            serde_json::from_slice(&request).map_err(|e| TransportError::Stream(e.to_string()))?;
        let response = match wire {
            FileShareWireRequest::RequestFile(req) => match self.server.request_file(caller, req).await {
                Ok(metadata) => FileShareWireResponse::Metadata(metadata),
                Err(e) => FileShareWireResponse::Error(e.to_string()),
            },
            FileShareWireRequest::DownloadFile(request_id) => {
                match self.server.download_file(caller, &request_id).await {
                    Ok(chunks) => FileShareWireResponse::Chunks(chunks),
                    Err(e) => FileShareWireResponse::Error(e.to_string()),
                }
            }
        };
        serde_json::to_vec(&response).map_err(|e| TransportError::Stream(e.to_string()))
    }
}

/// Client-side driver for `RequestFile`, over any `RpcTransport`.
pub async fn request_file_over_rpc(
    rpc: &dyn RpcTransport,
    peer: &PeerId,
    request: RequestFileRequest,
) -> Result<FileDownloadMetadata, CoreError> {
    let payload = serde_json::to_vec(&FileShareWireRequest::RequestFile(request))
        .map_err(|e| CoreError::Storage(crate::error::StorageError::Backend(e.to_string())))?;
    let raw = rpc.call(peer, FILE_SHARE_PROTOCOL_ID, payload).await?;
    match serde_json::from_slice::<FileShareWireResponse>(&raw) {
        Ok(FileShareWireResponse::Metadata(metadata)) => Ok(metadata),
        Ok(FileShareWireResponse::Error(msg)) => Err(CoreError::Transport(TransportError::Stream(msg))),
        _ => Err(CoreError::Transport(TransportError::Stream("malformed request-file reply".into()))),
    }
}

/// Client-side driver for `DownloadFile`, over any `RpcTransport`.
pub async fn download_file_over_rpc(
    rpc: &dyn RpcTransport,
    peer: &PeerId,
    request_id: &str,
) -> Result<Vec<Vec<u8>>, CoreError> {
    let payload = serde_json::to_vec(&FileShareWireRequest::DownloadFile(request_id.to_string()))
        .map_err(|e| CoreError::Storage(crate::error::StorageError::Backend(e.to_string())))?;
    let raw = rpc.call(peer, FILE_SHARE_PROTOCOL_ID, payload).await?;
    match serde_json::from_slice::<FileShareWireResponse>(&raw) {
        Ok(FileShareWireResponse::Chunks(chunks)) => Ok(chunks),
        Ok(FileShareWireResponse::Error(msg)) => Err(CoreError::Transport(TransportError::Stream(msg))),
        _ => Err(CoreError::Transport(TransportError::Stream("malformed download-file reply".into()))),
    }
}

fn random_iv() -> [u8; AES_IV_LEN] {
    let bytes = crypto::random_bytes(AES_IV_LEN);
    let mut iv = [0u8; AES_IV_LEN];
    iv.copy_from_slice(&bytes);
    iv
}

fn random_salt() -> [u8; 32] {
    let bytes = crypto::random_bytes(32);
    let mut salt = [0u8; 32];
    salt.copy_from_slice(&bytes);
    salt
}

/// Client side: derives keying material from a peer's `FileDownloadMetadata`
/// and decodes its chunk stream into the workspace's `temp` directory.
pub struct TransferClient {
    temp_dir: PathBuf,
}

impl TransferClient {
    pub fn new(temp_dir: PathBuf) -> Self {
        TransferClient { temp_dir }
    }

    fn derive_password_mode(password: &str, salt: &[u8; 32]) -> ([u8; AES_KEY_LEN], [u8; HMAC_KEY_LEN]) {
        let derived = crypto::pbkdf2_derive(password, salt);
        crypto::split_derived_key(&derived)
    }

    fn derive_contacts_mode(
        private_key: &rsa::RsaPrivateKey,
        encrypted_aes_key: &[u8],
        encrypted_hmac_key: &[u8],
    ) -> Result<([u8; AES_KEY_LEN], [u8; HMAC_KEY_LEN]), CryptoError> {
        let aes_bytes = crypto::rsa_oaep_decrypt(private_key, encrypted_aes_key)?;
        let hmac_bytes = crypto::rsa_oaep_decrypt(private_key, encrypted_hmac_key)?;
        let mut aes_key = [0u8; AES_KEY_LEN];
        let mut hmac_key = [0u8; HMAC_KEY_LEN];
        if aes_bytes.len() != AES_KEY_LEN || hmac_bytes.len() != HMAC_KEY_LEN {
            return Err(CryptoError::Decrypt);
        }
        aes_key.copy_from_slice(&aes_bytes);
        hmac_key.copy_from_slice(&hmac_bytes);
        Ok((aes_key, hmac_key))
    }

    /// Derive this download's keys from metadata plus whichever secret the
    /// workspace's security mode requires.
    pub fn derive_keys(
        metadata: &FileDownloadMetadata,
        password: Option<&str>,
        private_key: Option<&rsa::RsaPrivateKey>,
    ) -> Result<Zeroizing<([u8; AES_KEY_LEN], [u8; HMAC_KEY_LEN])>, CoreError> {
        match (&metadata.salt, password) {
            (Some(salt), Some(password)) => Ok(Zeroizing::new(Self::derive_password_mode(password, salt))),
            _ => {
                let private_key = private_key.ok_or(CoreError::InvalidCredentials)?;
                let encrypted_aes_key = metadata.encrypted_aes_key.as_deref().ok_or(CoreError::InvalidCredentials)?;
                let encrypted_hmac_key = metadata.encrypted_hmac_key.as_deref().ok_or(CoreError::InvalidCredentials)?;
                Ok(Zeroizing::new(Self::derive_contacts_mode(
                    private_key,
                    encrypted_aes_key,
                    encrypted_hmac_key,
                )?))
            }
        }
    }

    /// Decode a finite chunk stream into plaintext, verifying the trailing
    /// `iv || hmac_tag`. `chunks` is the full ordered sequence received from
    /// `DownloadFile`, ciphertext chunks followed by exactly one trailer.
    ///
    /// The decoder buffers one chunk behind the stream position: a chunk is
    /// only treated as data once a later chunk has arrived, since the
    /// trailer is indistinguishable from a data chunk until the stream ends.
    pub fn decode_stream(
        chunks: &[Vec<u8>],
        aes_key: &[u8; AES_KEY_LEN],
        hmac_key: &[u8; HMAC_KEY_LEN],
        expected_iv: &[u8; AES_IV_LEN],
    ) -> Result<Vec<u8>, CoreError> {
        if chunks.is_empty() {
            return Err(CoreError::IntegrityFailure);
        }
        let mut hmac = crypto::HmacAccumulator::new(hmac_key);
        let mut plaintext = Vec::new();
        let mut previous_chunk: Option<&[u8]> = None;

        for current in chunks {
            if let Some(previous) = previous_chunk {
                hmac.update(previous);
                let mut buf = previous.to_vec();
                crypto::aes_ctr_apply(aes_key, expected_iv, &mut buf);
                plaintext.extend_from_slice(&buf);
            }
            previous_chunk = Some(current.as_slice());
        }

        let trailer = previous_chunk.expect("chunks is non-empty");
        if trailer.len() < AES_IV_LEN {
            return Err(CoreError::IntegrityFailure);
        }
        let (iv_claim, tag_claim) = trailer.split_at(AES_IV_LEN);
        hmac.update(expected_iv);
        let expected_tag = hmac.finalize();

        if !crypto::constant_time_eq(iv_claim, expected_iv) || !crypto::constant_time_eq(tag_claim, &expected_tag) {
            return Err(CoreError::IntegrityFailure);
        }
        Ok(plaintext)
    }

    /// Write decoded plaintext to `file_name` under this client's temp
    /// directory, returning the path written.
    pub async fn write_to_temp(&self, file_name: &str, plaintext: &[u8]) -> Result<PathBuf, CoreError> {
        let path = self.temp_dir.join(file_name);
        tokio::fs::write(&path, plaintext).await.map_err(|source| {
            CoreError::Io(IoError::Fs {
                path: path.display().to_string(),
                source,
            })
        })?;
        Ok(path)
    }
}

pub fn workspace_requires_public_key(workspace: &WorkspaceInfo) -> bool {
    matches!(workspace.security, WorkspaceSecurity::Contacts { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge;
    use crate::crypto::{armor_public_key, double_sha256_hex, generate_keypair, RsaKeySize};
    use crate::model::{WorkspaceCredentials, WorkspaceType};
    use crate::storage::InMemoryStorage;
    use crate::verification::VerificationRequest;

    // DirectoryScanner double that reports one file by name/bytes without
    // walking a real directory, but still backs it with a real temp file:
    // `TransferServer::download_file` reads the shared file straight off
    // disk (the scanner is only consulted to build inventory metadata), so
    // the path handed back by `scan` has to resolve to real bytes.
    struct FakeScanner {
        path: PathBuf,
        data: Vec<u8>,
    }

    impl FakeScanner {
        fn new(name: &str, data: Vec<u8>) -> Self {
            let dir = std::env::temp_dir().join(format!("workspace-mesh-transfer-test-{}", Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            std::fs::write(&path, &data).unwrap();
            FakeScanner { path, data }
        }
    }

    impl crate::lister::DirectoryScanner for FakeScanner {
        fn scan(&self, _dir: &std::path::Path) -> Result<Vec<(PathBuf, u64, i64)>, IoError> {
            Ok(vec![(self.path.clone(), self.data.len() as u64, 0)])
        }
        fn read(&self, _path: &std::path::Path) -> Result<Vec<u8>, IoError> {
            Ok(self.data.clone())
        }
    }

    async fn verify_with_password(service: &VerificationService, mnemonic: &str, peer: PeerId, password: &str) {
        let challenge = service
            .begin_verification(VerificationRequest { workspace_mnemonic: mnemonic.to_string(), public_key: None })
            .await
            .unwrap();
        let solution = challenge::solve_password_challenge(&challenge, password).unwrap();
        service.finish_verification(solution, peer).await.unwrap();
    }

    async fn verify_with_keypair(
        service: &VerificationService,
        mnemonic: &str,
        peer: PeerId,
        public_key: String,
        private_key: &rsa::RsaPrivateKey,
    ) {
        let challenge = service
            .begin_verification(VerificationRequest { workspace_mnemonic: mnemonic.to_string(), public_key: Some(public_key) })
            .await
            .unwrap();
        let solution = challenge::solve_public_key_challenge(&challenge, private_key).unwrap();
        service.finish_verification(solution, peer).await.unwrap();
    }

    async fn password_server(data: Vec<u8>) -> (Arc<TransferServer>, String, String) {
        let mnemonic = "alpha bravo charlie".to_string();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        storage
            .put_workspace(&WorkspaceInfo {
                mnemonic: mnemonic.clone(),
                name: "demo".into(),
                workspace_type: WorkspaceType::SendReceive,
                owner_public_keys: Default::default(),
                security: WorkspaceSecurity::Password { hash: double_sha256_hex("hunter2") },
            })
            .await
            .unwrap();
        storage
            .put_credentials(&WorkspaceCredentials {
                mnemonic: mnemonic.clone(),
                public_key: None,
                private_key: None,
                password: Some("hunter2".to_string()),
            })
            .await
            .unwrap();
        let scanner = Arc::new(FakeScanner::new("report.pdf", data));
        let lister = Arc::new(Lister::new(PathBuf::from("/share"), scanner));
        lister.sweep().await;
        let checksum = lister.available_files().await[0].checksum.clone();
        let verification = Arc::new(VerificationService::new(storage.clone()));
        verify_with_password(&verification, &mnemonic, PeerId::from("peerB"), "hunter2").await;
        let server = Arc::new(TransferServer::new(storage, lister, verification));
        (server, mnemonic, checksum)
    }

    #[tokio::test]
    async fn password_mode_roundtrip_decodes_original_bytes() {
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
        let (server, mnemonic, checksum) = password_server(plaintext.clone()).await;

        let metadata = server
            .request_file(
                PeerId::from("peerB"),
                RequestFileRequest {
                    mnemonic: mnemonic.clone(),
                    file_checksum: checksum.clone(),
                    public_key: None,
                },
            )
            .await
            .unwrap();
        assert!(metadata.salt.is_some());
        assert!(metadata.encrypted_aes_key.is_none());

        let chunks = server.download_file(PeerId::from("peerB"), &metadata.request_id).await.unwrap();
        let keys = TransferClient::derive_keys(&metadata, Some("hunter2"), None).unwrap();
        let decoded = TransferClient::decode_stream(&chunks, &keys.0, &keys.1, &metadata.iv).unwrap();
        assert_eq!(decoded, plaintext);
    }

    /// Chunking idempotence at the sizes that bound `CHUNK_SIZE`'s
    /// trailer-framing edge cases: empty, single byte, one under/at/over a
    /// full chunk, and multi-chunk.
    #[tokio::test]
    async fn chunking_roundtrips_at_chunk_boundary_sizes() {
        for size in [0usize, 1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 1_000_000] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let (server, mnemonic, checksum) = password_server(plaintext.clone()).await;

            let metadata = server
                .request_file(
                    PeerId::from("peerB"),
                    RequestFileRequest {
                        mnemonic: mnemonic.clone(),
                        file_checksum: checksum.clone(),
                        public_key: None,
                    },
                )
                .await
                .unwrap();

            let chunks = server.download_file(PeerId::from("peerB"), &metadata.request_id).await.unwrap();
            let keys = TransferClient::derive_keys(&metadata, Some("hunter2"), None).unwrap();
            let decoded = TransferClient::decode_stream(&chunks, &keys.0, &keys.1, &metadata.iv).unwrap();
            assert_eq!(decoded, plaintext, "size {size} did not round-trip");
        }
    }

    #[tokio::test]
    async fn unverified_caller_rejected() {
        let (server, mnemonic, checksum) = password_server(b"data".to_vec()).await;
        let err = server
            .request_file(
                PeerId::from("stranger"),
                RequestFileRequest {
                    mnemonic,
                    file_checksum: checksum,
                    public_key: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotPermitted));
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_integrity_check() {
        let plaintext = b"some bytes to protect".to_vec();
        let (server, mnemonic, checksum) = password_server(plaintext).await;
        let metadata = server
            .request_file(
                PeerId::from("peerB"),
                RequestFileRequest { mnemonic, file_checksum: checksum, public_key: None },
            )
            .await
            .unwrap();
        let mut chunks = server.download_file(PeerId::from("peerB"), &metadata.request_id).await.unwrap();
        chunks[0][0] ^= 0xFF;
        let keys = TransferClient::derive_keys(&metadata, Some("hunter2"), None).unwrap();
        let err = TransferClient::decode_stream(&chunks, &keys.0, &keys.1, &metadata.iv).unwrap_err();
        assert!(matches!(err, CoreError::IntegrityFailure));
    }

    #[tokio::test]
    async fn contacts_mode_roundtrip_uses_rsa_wrapped_keys() {
        let mnemonic = "delta echo foxtrot".to_string();
        let requester = generate_keypair(RsaKeySize::Bits2048, "Bob", "bob@example.com").unwrap();
        let requester_key = armor_public_key(&requester.public_key).unwrap();
        let mut allowed = std::collections::HashSet::new();
        allowed.insert(requester_key.clone());

        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        storage
            .put_workspace(&WorkspaceInfo {
                mnemonic: mnemonic.clone(),
                name: "demo".into(),
                workspace_type: WorkspaceType::SendReceive,
                owner_public_keys: Default::default(),
                security: WorkspaceSecurity::Contacts { allowed_public_keys: allowed },
            })
            .await
            .unwrap();
        storage
            .put_credentials(&WorkspaceCredentials {
                mnemonic: mnemonic.clone(),
                public_key: None,
                private_key: None,
                password: None,
            })
            .await
            .unwrap();
        let plaintext = b"contacts mode payload".to_vec();
        let scanner = Arc::new(FakeScanner::new("secret.bin", plaintext.clone()));
        let lister = Arc::new(Lister::new(PathBuf::from("/share"), scanner));
        lister.sweep().await;
        let checksum = lister.available_files().await[0].checksum.clone();
        let verification = Arc::new(VerificationService::new(storage.clone()));
        verify_with_keypair(&verification, &mnemonic, PeerId::from("bob"), requester_key.clone(), &requester.private_key).await;
        let server = TransferServer::new(storage, lister, verification);

        let metadata = server
            .request_file(
                PeerId::from("bob"),
                RequestFileRequest {
                    mnemonic,
                    file_checksum: checksum,
                    public_key: Some(requester_key),
                },
            )
            .await
            .unwrap();
        assert!(metadata.salt.is_none());
        assert!(metadata.encrypted_aes_key.is_some());

        let chunks = server.download_file(PeerId::from("bob"), &metadata.request_id).await.unwrap();
        let keys = TransferClient::derive_keys(&metadata, None, Some(&requester.private_key)).unwrap();
        let decoded = TransferClient::decode_stream(&chunks, &keys.0, &keys.1, &metadata.iv).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[tokio::test]
    async fn rpc_wired_roundtrip_over_loopback_transport() {
        use crate::transport::loopback::LoopbackNetwork;
        use crate::transport::Transport;

        let plaintext = b"shipped over the wire, chunk by chunk".to_vec();
        let (server, mnemonic, checksum) = password_server(plaintext.clone()).await;

        let network = LoopbackNetwork::new();
        let server_transport = network.peer(PeerId::from("peerA"));
        let client_transport = network.peer(PeerId::from("peerB"));
        server_transport
            .register_handler(FILE_SHARE_PROTOCOL_ID, Arc::new(TransferRpcHandler { server: server.clone() }))
            .await;

        let rpc = Transport::rpc(&client_transport);
        let metadata = request_file_over_rpc(
            rpc.as_ref(),
            &PeerId::from("peerA"),
            RequestFileRequest { mnemonic, file_checksum: checksum, public_key: None },
        )
        .await
        .unwrap();
        let chunks = download_file_over_rpc(rpc.as_ref(), &PeerId::from("peerA"), &metadata.request_id)
            .await
            .unwrap();
        let keys = TransferClient::derive_keys(&metadata, Some("hunter2"), None).unwrap();
        let decoded = TransferClient::decode_stream(&chunks, &keys.0, &keys.1, &metadata.iv).unwrap();
        assert_eq!(decoded, plaintext);
    }
}
