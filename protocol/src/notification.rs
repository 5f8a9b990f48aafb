//! Notifications handed to external subscribers.
//!
//! All of these are owned snapshots: once built, nothing in the core keeps a
//! reference into them, so a subscriber may hold or forward them freely.
//! Balances are already formatted through the session's currency parser and
//! keyed by alias (`self` for the local user).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::APIError;

/// Alias → formatted balance.
pub type BalanceMap = BTreeMap<String, String>;

/// A peer wants to open a channel with us.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalNotif {
    pub proposal_id: String,
    pub peer_alias: String,
    pub currency: String,
    pub opening_balances: BalanceMap,
    pub challenge_duration_secs: u64,
    /// Answers after this instant are refused by the protocol client.
    pub expiry: DateTime<Utc>,
}

/// The peer of a channel proposes a new balance split.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotif {
    pub update_id: String,
    pub channel_id: String,
    pub currency: String,
    pub proposed_balances: BalanceMap,
    pub version: String,
    /// A final update is the peer's request to close the channel.
    pub is_final: bool,
    pub expiry: DateTime<Utc>,
}

/// A channel was settled on-chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseNotif {
    pub channel_id: String,
    pub currency: String,
    pub closing_balances: BalanceMap,
    pub version: String,
    /// Set when the closure was observed but could not be processed cleanly.
    pub error: Option<APIError>,
}
