//! # Contacts
//!
//! Maps human-friendly aliases to peer addresses. Sessions resolve every
//! alias a caller passes (open channel, pay) and every address the protocol
//! reports (incoming proposal) through this store.
//!
//! [`JsonContacts`] keeps the map in memory and, when given a path, rewrites
//! the whole file after each mutation. Writes go to a sibling temp file first
//! and are renamed into place, so a crash never leaves a half-written file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::client::Address;
use crate::config::SELF_ALIAS;

/// A known peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub alias: String,
    /// Off-chain address the peer signs with.
    pub off_chain_address: Address,
    /// Transport endpoint of the peer.
    pub comm_address: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContactsError {
    #[error("alias {0:?} is reserved")]
    ReservedAlias(String),

    #[error("alias {0:?} is already in use")]
    AliasTaken(String),

    #[error("address {address} is already registered as {alias:?}")]
    AddressTaken { address: String, alias: String },

    #[error("no contact with alias {0:?}")]
    NotFound(String),

    #[error("contacts file {path}: {reason}")]
    Storage { path: String, reason: String },
}

/// Alias ⇄ peer lookup with write, delete and persistence.
pub trait ContactStore: Send + Sync {
    fn by_alias(&self, alias: &str) -> Option<Peer>;

    fn by_address(&self, address: &Address) -> Option<Peer>;

    /// Add a new contact. Aliases and addresses must both be unused.
    fn write(&self, peer: Peer) -> Result<(), ContactsError>;

    fn delete(&self, alias: &str) -> Result<(), ContactsError>;

    /// All contacts, sorted by alias.
    fn all(&self) -> Vec<Peer>;
}

/// Contact store backed by an optional JSON file.
#[derive(Debug)]
pub struct JsonContacts {
    path: Option<PathBuf>,
    peers: RwLock<HashMap<String, Peer>>,
}

impl JsonContacts {
    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Load contacts from `path`. A missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self, ContactsError> {
        let storage_err = |reason: String| ContactsError::Storage {
            path: path.display().to_string(),
            reason,
        };
        let peers = match std::fs::read_to_string(path) {
            Ok(raw) => {
                let list: Vec<Peer> =
                    serde_json::from_str(&raw).map_err(|e| storage_err(e.to_string()))?;
                let mut map = HashMap::with_capacity(list.len());
                for peer in list {
                    if peer.alias == SELF_ALIAS {
                        return Err(ContactsError::ReservedAlias(peer.alias));
                    }
                    if map.insert(peer.alias.clone(), peer.clone()).is_some() {
                        return Err(ContactsError::AliasTaken(peer.alias));
                    }
                }
                map
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(storage_err(e.to_string())),
        };
        debug!(path = %path.display(), count = peers.len(), "contacts loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            peers: RwLock::new(peers),
        })
    }

    fn persist(&self, peers: &HashMap<String, Peer>) -> Result<(), ContactsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let storage_err = |reason: String| ContactsError::Storage {
            path: path.display().to_string(),
            reason,
        };

        let mut list: Vec<&Peer> = peers.values().collect();
        list.sort_by(|a, b| a.alias.cmp(&b.alias));
        let raw = serde_json::to_vec_pretty(&list).map_err(|e| storage_err(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw).map_err(|e| storage_err(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| storage_err(e.to_string()))
    }
}

impl ContactStore for JsonContacts {
    fn by_alias(&self, alias: &str) -> Option<Peer> {
        self.peers.read().get(alias).cloned()
    }

    fn by_address(&self, address: &Address) -> Option<Peer> {
        self.peers
            .read()
            .values()
            .find(|p| &p.off_chain_address == address)
            .cloned()
    }

    fn write(&self, peer: Peer) -> Result<(), ContactsError> {
        if peer.alias == SELF_ALIAS {
            return Err(ContactsError::ReservedAlias(peer.alias));
        }
        let mut peers = self.peers.write();
        if peers.contains_key(&peer.alias) {
            return Err(ContactsError::AliasTaken(peer.alias));
        }
        if let Some(existing) = peers
            .values()
            .find(|p| p.off_chain_address == peer.off_chain_address)
        {
            return Err(ContactsError::AddressTaken {
                address: peer.off_chain_address.to_string(),
                alias: existing.alias.clone(),
            });
        }
        let alias = peer.alias.clone();
        peers.insert(alias.clone(), peer);
        if let Err(e) = self.persist(&peers) {
            peers.remove(&alias);
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, alias: &str) -> Result<(), ContactsError> {
        let mut peers = self.peers.write();
        let removed = peers
            .remove(alias)
            .ok_or_else(|| ContactsError::NotFound(alias.to_string()))?;
        if let Err(e) = self.persist(&peers) {
            peers.insert(removed.alias.clone(), removed);
            return Err(e);
        }
        Ok(())
    }

    fn all(&self) -> Vec<Peer> {
        let mut list: Vec<Peer> = self.peers.read().values().cloned().collect();
        list.sort_by(|a, b| a.alias.cmp(&b.alias));
        list
    }
}
