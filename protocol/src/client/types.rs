//! Value types exchanged with the channel protocol client.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A chain or off-chain account address, as accepted by the wallet backend.
///
/// Construction is only possible through a [`WalletBackend`](super::WalletBackend),
/// so every `Address` in the core has passed the backend's syntax checks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Wrap an already validated, normalized address string.
    pub fn new_unchecked(normalized: impl Into<String>) -> Self {
        Address(normalized.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The user a session acts for, with addresses already parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub on_chain: Address,
    pub off_chain: Address,
    pub comm_address: String,
}

/// Optional application attached to a channel. Plain payment channels
/// carry none.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Address of the app definition contract.
    pub definition: String,
    /// Opaque, app-specific initial data.
    #[serde(default)]
    pub data: String,
}

/// An off-chain channel state as agreed by both participants.
///
/// Balances are indexed by participant: index 0 is the proposer of the
/// channel, index 1 the acceptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub version: u64,
    pub balances: [u128; 2],
    pub is_final: bool,
}

impl ChannelState {
    /// Opening state: version 0, not final.
    pub fn initial(balances: [u128; 2]) -> Self {
        Self {
            version: 0,
            balances,
            is_final: false,
        }
    }

    /// The successor state carrying `balances`.
    pub fn next(&self, balances: [u128; 2]) -> Self {
        Self {
            version: self.version + 1,
            balances,
            is_final: false,
        }
    }

    /// The successor state with unchanged balances, marked final.
    pub fn finalized(&self) -> Self {
        Self {
            version: self.version + 1,
            balances: self.balances,
            is_final: true,
        }
    }

    pub fn total(&self) -> u128 {
        self.balances[0].saturating_add(self.balances[1])
    }
}

/// Parameters of an outgoing channel proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelProposal {
    /// Off-chain address of the peer.
    pub peer: Address,
    /// Transport endpoint of the peer.
    pub peer_comm_address: String,
    /// `[proposer, acceptor]` opening balances in minimal units.
    pub opening_balances: [u128; 2],
    pub challenge_duration_secs: u64,
    pub currency: String,
    pub app: Option<AppDescriptor>,
}

/// A channel proposal received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingProposal {
    pub proposal_id: String,
    /// Off-chain address of the proposing peer.
    pub proposer: Address,
    /// `[proposer, acceptor]` opening balances in minimal units.
    pub opening_balances: [u128; 2],
    pub challenge_duration_secs: u64,
    pub currency: String,
    pub app: Option<AppDescriptor>,
}

/// A state update received from the peer of an existing channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingUpdate {
    pub channel_id: String,
    pub proposed: ChannelState,
}
