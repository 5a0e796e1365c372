// src/model.rs
// Data model shared across the core (spec section 3)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Stable network identifier for a peer. Equality is by identifier bytes,
/// exactly as the libp2p-compatible transport hands them out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Which role (owner vs non-owner) publishes vs subscribes in a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceType {
    SendOnly,
    ReceiveOnly,
    SendReceive,
}

/// The workspace's `oneof security_settings` made total over both variants,
/// per the section 9 design note ("dynamic typing of security settings").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "security_type", rename_all = "snake_case")]
pub enum WorkspaceSecurity {
    /// `hash = hex(SHA256(SHA256(password)))`
    Password { hash: String },
    /// PEM-armored RSA public keys granted read access.
    Contacts {
        allowed_public_keys: HashSet<String>,
    },
}

/// Workspace descriptor (`WorkspaceInfo`), minted by a rendezvous node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub mnemonic: String,
    pub name: String,
    pub workspace_type: WorkspaceType,
    pub owner_public_keys: HashSet<String>,
    pub security: WorkspaceSecurity,
}

impl WorkspaceInfo {
    /// True if `public_key` is one of the workspace's owner keys.
    pub fn is_owner(&self, public_key: &str) -> bool {
        self.owner_public_keys.iter().any(|k| k == public_key)
    }

    /// True if `public_key` may read the workspace: an owner, or (for
    /// contacts workspaces) an explicitly allowed key.
    pub fn is_permitted(&self, public_key: &str) -> bool {
        if self.is_owner(public_key) {
            return true;
        }
        match &self.security {
            WorkspaceSecurity::Contacts {
                allowed_public_keys,
            } => allowed_public_keys.iter().any(|k| k == public_key),
            WorkspaceSecurity::Password { .. } => false,
        }
    }
}

/// This node's own secrets for a workspace. Only `password` is set for
/// password workspaces; only the identity keypair for contacts workspaces.
#[derive(Clone, Serialize, Deserialize)]
pub struct WorkspaceCredentials {
    pub mnemonic: String,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for WorkspaceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceCredentials")
            .field("mnemonic", &self.mnemonic)
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// `{ name, extension, size_bytes, mtime_unix, checksum }`. Checksum is the
/// sole identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub extension: String,
    pub size_bytes: u64,
    pub mtime_unix: i64,
    pub checksum: String,
}
