//! # External Collaborators
//!
//! The state-channel protocol, the blockchain and the wallet are not
//! implemented by this crate. They are consumed through the traits below so
//! that the session core can be driven by a real protocol library in
//! production and by the in-process [`sim`](crate::sim) backend in tests.
//!
//! ```text
//!   Session ──propose/update/settle──► ChannelClient / ChannelHandle
//!      ▲                                       │
//!      └──── ProtocolEventHandler ◄── proposal / update / concluded events
//! ```
//!
//! Event callbacks are synchronous and must return quickly: implementations
//! stash the responder and enqueue a notification, nothing more. Responders
//! are single-use (`self: Box<Self>`), which makes "respond twice" a type
//! error inside the core and a lookup miss at the API surface.

mod error;
mod types;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SessionConfig;

pub use error::ClientError;
pub use types::{
    Address, AppDescriptor, ChannelProposal, ChannelState, IncomingProposal, IncomingUpdate,
    UserIdentity,
};

/// Receives asynchronous events from the protocol client.
pub trait ProtocolEventHandler: Send + Sync {
    /// A peer proposed a new channel. Respond through `responder`.
    fn handle_proposal(&self, proposal: IncomingProposal, responder: Box<dyn ProposalResponder>);

    /// The peer of an existing channel proposed a new state.
    fn handle_update(&self, update: IncomingUpdate, responder: Box<dyn UpdateResponder>);

    /// A channel was settled on-chain by either participant.
    fn handle_concluded(&self, channel_id: &str, final_state: ChannelState);
}

/// Single-use answer to an incoming channel proposal.
#[async_trait]
pub trait ProposalResponder: Send + Sync {
    /// Accept and fund the channel. Returns the acceptor's channel handle.
    async fn accept(self: Box<Self>) -> Result<Arc<dyn ChannelHandle>, ClientError>;

    /// Decline the proposal.
    async fn reject(self: Box<Self>, reason: &str) -> Result<(), ClientError>;
}

/// Single-use answer to an incoming channel update.
#[async_trait]
pub trait UpdateResponder: Send + Sync {
    async fn accept(self: Box<Self>) -> Result<(), ClientError>;

    async fn reject(self: Box<Self>, reason: &str) -> Result<(), ClientError>;
}

/// One established channel as seen by the protocol client.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Index of the local participant in `participants()` and in balances.
    fn own_index(&self) -> usize;

    /// Off-chain addresses, `[proposer, acceptor]`.
    fn participants(&self) -> [Address; 2];

    /// Latest state both participants signed.
    fn state(&self) -> ChannelState;

    fn challenge_duration_secs(&self) -> u64;

    fn currency(&self) -> &str;

    /// Whether the channel has been settled on-chain.
    fn is_concluded(&self) -> bool;

    /// Propose `next` to the peer and wait for its signature.
    async fn update(&self, next: ChannelState) -> Result<(), ClientError>;

    /// Register the latest state on-chain and withdraw. Settling a channel
    /// that is already concluded succeeds without a transaction.
    async fn settle(&self) -> Result<(), ClientError>;
}

/// Protocol client bound to one user.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Off-chain address the client signs and listens with.
    fn address(&self) -> &Address;

    /// Install the receiver of incoming events. Replaces any previous one.
    fn set_handler(&self, handler: Arc<dyn ProtocolEventHandler>);

    /// Propose a channel and wait until it is funded.
    async fn propose_channel(
        &self,
        proposal: ChannelProposal,
    ) -> Result<Arc<dyn ChannelHandle>, ClientError>;

    /// Look up an established channel.
    fn channel(&self, id: &str) -> Result<Arc<dyn ChannelHandle>, ClientError>;

    /// Channels recovered from the client's persistence.
    async fn restore_channels(&self) -> Result<Vec<Arc<dyn ChannelHandle>>, ClientError>;

    /// Stop listening for events and release resources.
    async fn close(&self) -> Result<(), ClientError>;
}

/// Address parsing and account access.
pub trait WalletBackend: Send + Sync {
    fn parse_address(&self, raw: &str) -> Result<Address, ClientError>;

    fn unlock(&self, keystore: &Path, account: &Address, password: &str)
        -> Result<(), ClientError>;
}

/// On-chain contract access.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Check that the adjudicator and asset contracts exist at the given
    /// addresses on the chain behind `chain_url`.
    async fn validate_contracts(
        &self,
        chain_url: &str,
        adjudicator: &Address,
        asset: &Address,
    ) -> Result<(), ClientError>;
}

/// Builds a protocol client for a validated session.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        user: &UserIdentity,
        config: &SessionConfig,
    ) -> Result<Arc<dyn ChannelClient>, ClientError>;
}

/// The set of backends a node opens sessions against.
#[derive(Clone)]
pub struct Backends {
    pub wallet: Arc<dyn WalletBackend>,
    pub chain: Arc<dyn ChainBackend>,
    pub clients: Arc<dyn ClientFactory>,
}
