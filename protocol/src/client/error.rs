//! Errors raised by the external protocol, chain and wallet backends.
//!
//! These never leave the core unclassified: every public operation converts
//! them into an [`APIError`](crate::error::APIError) at the call site.

use thiserror::Error;

/// Failure reported by a backend implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The peer answered and declined the request.
    #[error("peer rejected the request: {0}")]
    Rejected(String),

    /// No connection to the peer could be established.
    #[error("peer {0} is not reachable")]
    PeerUnreachable(String),

    /// The peer did not answer within the protocol's own timeout.
    #[error("peer did not respond in time")]
    ResponseTimeout,

    /// A response was given after the request had expired.
    #[error("request expired before a response was given")]
    Expired,

    /// The peer did not deposit its share of the opening balance.
    #[error("peer did not fund the channel")]
    PeerNotFunded,

    /// The blockchain node could not be contacted.
    #[error("chain not reachable at {0}")]
    ChainUnreachable(String),

    /// An on-chain transaction was not confirmed in time.
    #[error("transaction {0} was not mined in time")]
    TxTimeout(String),

    /// A dispute with an outdated state was registered on-chain.
    #[error("channel {0} was disputed on-chain with a stale state")]
    Disputed(String),

    /// The configured contracts are missing or not the expected code.
    #[error("invalid contracts: {0}")]
    InvalidContracts(String),

    /// An address string could not be parsed.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// Keystore could not be opened or an account could not be unlocked.
    #[error("wallet error: {0}")]
    Wallet(String),

    /// The client has no channel with this id.
    #[error("unknown channel {0}")]
    UnknownChannel(String),

    /// Anything the backend could not classify further.
    #[error("{0}")]
    Other(String),
}
