// src/config.rs
// Ambient node configuration: constructed directly by the embedding
// binary/tests. No config-file parser is in scope here -- loading this
// from disk, if wanted, is the embedding application's job.

use crate::crypto::RsaKeySize;
use crate::lister::DEFAULT_SWEEP_INTERVAL_SECS;
use crate::model::PeerId;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory under which `files/<workspace-slug>/{share,temp}` and
    /// the peer keypair live.
    pub base_dir: PathBuf,
    pub bind_host: String,
    pub bind_port: u16,
    /// Cached rendezvous peer ids, in preference order.
    pub rendezvous_ids: Vec<PeerId>,
    pub sweep_interval: Duration,
    pub rsa_key_size: RsaKeySize,
}

impl NodeConfig {
    pub fn new(base_dir: PathBuf) -> Self {
        NodeConfig {
            base_dir,
            bind_host: "0.0.0.0".to_string(),
            bind_port: 0,
            rendezvous_ids: Vec::new(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            rsa_key_size: RsaKeySize::Bits2048,
        }
    }

    pub fn with_rendezvous_ids(mut self, ids: Vec<PeerId>) -> Self {
        self.rendezvous_ids = ids;
        self
    }

    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.bind_host = host.into();
        self.bind_port = port;
        self
    }
}
