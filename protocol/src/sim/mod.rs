//! # Simulated Backend
//!
//! An in-process stand-in for the wallet, the blockchain and the channel
//! protocol. Every party connected to the same [`SimNetwork`] can propose,
//! update and settle channels with every other party, with the peer's
//! session answering through the same responders a real protocol library
//! would hand out.
//!
//! The chain is a flag and a set of deployed contracts. Settlement is
//! instant and notifies both participants. Channels stay in the network
//! after their owners disconnect, which is what lets a reopened session
//! restore them.
//!
//! Counters record every propose, update and settle request so tests can
//! assert that a rejected call never reached the protocol.

mod client;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::client::{
    Address, Backends, ChainBackend, ChannelClient, ClientError, ClientFactory, UserIdentity,
    WalletBackend,
};
use crate::config::SessionConfig;

pub use client::SimClient;
use client::ChannelCore;

/// Adjudicator contract deployed on every fresh sim chain.
pub const SIM_ADJUDICATOR: &str = "0x00000000000000000000000000000000000000a1";

/// Asset holder contract deployed on every fresh sim chain.
pub const SIM_ASSET: &str = "0x00000000000000000000000000000000000000a2";

#[derive(Default)]
struct Counters {
    propose: AtomicU64,
    update: AtomicU64,
    settle: AtomicU64,
}

pub(crate) struct NetInner {
    parties: DashMap<Address, Arc<client::Party>>,
    channels: DashMap<String, Arc<ChannelCore>>,
    contracts: DashMap<Address, ()>,
    passwords: DashMap<Address, String>,
    chain_reachable: AtomicBool,
    counters: Counters,
}

/// A shared in-process network. Cheap to clone.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<NetInner>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        let inner = NetInner {
            parties: DashMap::new(),
            channels: DashMap::new(),
            contracts: DashMap::new(),
            passwords: DashMap::new(),
            chain_reachable: AtomicBool::new(true),
            counters: Counters::default(),
        };
        inner
            .contracts
            .insert(Address::new_unchecked(SIM_ADJUDICATOR), ());
        inner.contracts.insert(Address::new_unchecked(SIM_ASSET), ());
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Backends a [`Node`](crate::node::Node) can open sessions against.
    pub fn backends(&self) -> Backends {
        let backend = Arc::new(SimBackend { net: self.clone() });
        Backends {
            wallet: backend.clone(),
            chain: backend.clone(),
            clients: backend,
        }
    }

    /// Toggle chain reachability. Affects contract validation and settlement.
    pub fn set_chain_reachable(&self, reachable: bool) {
        self.inner.chain_reachable.store(reachable, Ordering::SeqCst);
    }

    /// Require `password` to unlock `account`. Accounts without one unlock
    /// with any password.
    pub fn set_password(&self, account: &str, password: &str) {
        self.inner.passwords.insert(
            Address::new_unchecked(account.to_ascii_lowercase()),
            password.to_string(),
        );
    }

    pub fn propose_requests(&self) -> u64 {
        self.inner.counters.propose.load(Ordering::SeqCst)
    }

    pub fn update_requests(&self) -> u64 {
        self.inner.counters.update.load(Ordering::SeqCst)
    }

    pub fn settle_requests(&self) -> u64 {
        self.inner.counters.settle.load(Ordering::SeqCst)
    }

    /// Whether a party is currently connected at `address`.
    pub fn is_online(&self, address: &str) -> bool {
        self.inner
            .parties
            .contains_key(&Address::new_unchecked(address.to_ascii_lowercase()))
    }
}

impl NetInner {
    fn chain_reachable(&self) -> bool {
        self.chain_reachable.load(Ordering::SeqCst)
    }
}

/// Implements every backend trait on top of a [`SimNetwork`].
pub struct SimBackend {
    net: SimNetwork,
}

impl WalletBackend for SimBackend {
    /// `0x` followed by 40 hex digits; normalized to lowercase.
    fn parse_address(&self, raw: &str) -> Result<Address, ClientError> {
        let hex_part = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .ok_or_else(|| ClientError::InvalidAddress(raw.to_string()))?;
        if hex_part.len() != 40 || hex::decode(hex_part).is_err() {
            return Err(ClientError::InvalidAddress(raw.to_string()));
        }
        Ok(Address::new_unchecked(format!(
            "0x{}",
            hex_part.to_ascii_lowercase()
        )))
    }

    fn unlock(&self, _keystore: &Path, account: &Address, password: &str) -> Result<(), ClientError> {
        match self.net.inner.passwords.get(account) {
            Some(expected) if expected.value() != password => Err(ClientError::Wallet(format!(
                "wrong password for {}",
                account
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ChainBackend for SimBackend {
    async fn validate_contracts(
        &self,
        chain_url: &str,
        adjudicator: &Address,
        asset: &Address,
    ) -> Result<(), ClientError> {
        let inner = &self.net.inner;
        if !inner.chain_reachable() {
            return Err(ClientError::ChainUnreachable(chain_url.to_string()));
        }
        for contract in [adjudicator, asset] {
            if !inner.contracts.contains_key(contract) {
                return Err(ClientError::InvalidContracts(format!(
                    "no contract deployed at {}",
                    contract
                )));
            }
        }
        if adjudicator == asset {
            return Err(ClientError::InvalidContracts(
                "adjudicator and asset holder are the same contract".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientFactory for SimBackend {
    async fn connect(
        &self,
        user: &UserIdentity,
        _config: &SessionConfig,
    ) -> Result<Arc<dyn ChannelClient>, ClientError> {
        let client: Arc<dyn ChannelClient> = SimClient::connect(Arc::clone(&self.net.inner), user)?;
        debug!(address = %user.off_chain, "sim client connected");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes_addresses() {
        let backend = SimBackend {
            net: SimNetwork::new(),
        };
        let addr = backend
            .parse_address("0xABCDEFabcdef0123456789012345678901234567")
            .unwrap();
        assert_eq!(addr.as_str(), "0xabcdefabcdef0123456789012345678901234567");

        assert!(backend.parse_address("abcdef").is_err());
        assert!(backend.parse_address("0x1234").is_err());
        assert!(backend
            .parse_address("0xZZZZEFabcdef0123456789012345678901234567")
            .is_err());
    }

    #[tokio::test]
    async fn contract_validation_follows_chain_state() {
        let net = SimNetwork::new();
        let backend = SimBackend { net: net.clone() };
        let adj = Address::new_unchecked(SIM_ADJUDICATOR);
        let asset = Address::new_unchecked(SIM_ASSET);

        backend.validate_contracts("ws://sim", &adj, &asset).await.unwrap();
        assert!(matches!(
            backend.validate_contracts("ws://sim", &adj, &adj).await,
            Err(ClientError::InvalidContracts(_))
        ));

        net.set_chain_reachable(false);
        assert!(matches!(
            backend.validate_contracts("ws://sim", &adj, &asset).await,
            Err(ClientError::ChainUnreachable(_))
        ));
    }

    #[test]
    fn unlock_checks_registered_password() {
        let net = SimNetwork::new();
        let backend = SimBackend { net: net.clone() };
        let account = Address::new_unchecked("0x1111111111111111111111111111111111111111");
        backend.unlock(Path::new("/ks"), &account, "anything").unwrap();

        net.set_password(account.as_str(), "secret");
        assert!(backend.unlock(Path::new("/ks"), &account, "wrong").is_err());
        backend.unlock(Path::new("/ks"), &account, "secret").unwrap();
    }
}
