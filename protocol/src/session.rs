//! # Session
//!
//! A session is one user's view of the payment-channel network: its
//! contacts, its channels, and the proposal and close notification streams.
//!
//! The protocol client calls back into the session through a
//! [`ProtocolEventHandler`] that holds only a weak reference, so dropping the
//! last strong reference to a session is enough to stop event routing.
//!
//! Incoming proposals are held with their single-use responder until the
//! user answers (`respond_to_proposal`), the proposer stops waiting, or the
//! session closes. The first answer takes the responder out of the table;
//! any later answer for the same id, or one after the proposal expired, is a
//! `ResourceNotFound`.
//!
//! Channels being proposed or accepted count as in flight from the first
//! protocol call until they are registered. A session does not close
//! without `force` while any are in flight, and a channel that completes
//! after the session closed is settled instead of registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{expiry_after, still_awaited, ChannelInfo, ChannelSession, LockState};
use crate::client::{
    Address, AppDescriptor, ChannelClient, ChannelHandle, ChannelProposal, ChannelState,
    IncomingProposal, IncomingUpdate, ProposalResponder, ProtocolEventHandler, UpdateResponder,
    UserIdentity, WalletBackend,
};
use crate::config::SELF_ALIAS;
use crate::contacts::{ContactStore, Peer};
use crate::context::CallContext;
use crate::currency::CurrencyParser;
use crate::error::{resource, APIError};
use crate::notification::{BalanceMap, CloseNotif, ProposalNotif};
use crate::subscription::{Notifier, SubscriptionSlot};
use crate::timeout::TimeoutConfig;

/// Everything a session is built from. Assembled by the node after the
/// configuration has been validated.
pub struct SessionParts {
    pub id: String,
    pub user: UserIdentity,
    pub client: Arc<dyn ChannelClient>,
    pub contacts: Arc<dyn ContactStore>,
    pub wallet: Arc<dyn WalletBackend>,
    pub currency: Arc<dyn CurrencyParser>,
    pub timeouts: TimeoutConfig,
}

struct PendingProposal {
    peer: Peer,
    challenge_duration_secs: u64,
    expires_at: Instant,
    responder: Box<dyn ProposalResponder>,
}

impl PendingProposal {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct ChannelTable {
    by_id: HashMap<String, Arc<ChannelSession>>,
    /// Proposals sent or accepted whose channel is not registered yet.
    opening: usize,
}

/// Counts one channel open as in flight until dropped.
struct Opening<'a> {
    session: &'a Session,
}

impl Drop for Opening<'_> {
    fn drop(&mut self) {
        let mut table = self.session.channels.write();
        table.opening = table.opening.saturating_sub(1);
    }
}

/// One user session.
pub struct Session {
    id: String,
    user: UserIdentity,
    client: Arc<dyn ChannelClient>,
    contacts: Arc<dyn ContactStore>,
    wallet: Arc<dyn WalletBackend>,
    currency: Arc<dyn CurrencyParser>,
    timeouts: TimeoutConfig,
    channels: RwLock<ChannelTable>,
    proposals: Mutex<HashMap<String, PendingProposal>>,
    proposal_slot: SubscriptionSlot<ProposalNotif>,
    close_slot: SubscriptionSlot<CloseNotif>,
    closed: AtomicBool,
}

impl Session {
    /// Build the session and install it as the client's event handler.
    pub fn new(parts: SessionParts) -> Arc<Self> {
        let session = Arc::new(Self {
            proposal_slot: SubscriptionSlot::new(format!("proposals:{}", parts.id)),
            close_slot: SubscriptionSlot::new(format!("closes:{}", parts.id)),
            id: parts.id,
            user: parts.user,
            client: parts.client,
            contacts: parts.contacts,
            wallet: parts.wallet,
            currency: parts.currency,
            timeouts: parts.timeouts,
            channels: RwLock::new(ChannelTable::default()),
            proposals: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        session.client.set_handler(Arc::new(EventRouter {
            session: Arc::downgrade(&session),
        }));
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn currency(&self) -> &str {
        self.currency.symbol()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn require_open(&self) -> Result<(), APIError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> APIError {
        APIError::failed_pre_condition(format!("session {} is closed", self.id))
    }

    /// Mark a channel open as in flight. Checked against `closed` under the
    /// channel table lock, which `close` also takes.
    fn begin_opening(&self) -> Result<Opening<'_>, APIError> {
        let mut table = self.channels.write();
        if self.is_closed() {
            return Err(self.closed_error());
        }
        table.opening += 1;
        Ok(Opening { session: self })
    }

    // -----------------------------------------------------------------------
    // Contacts
    // -----------------------------------------------------------------------

    /// Register a peer. The address must be accepted by the wallet backend.
    pub fn add_contact(
        &self,
        alias: &str,
        off_chain_address: &str,
        comm_address: &str,
    ) -> Result<Peer, APIError> {
        self.require_open()?;
        if alias.trim().is_empty() {
            return Err(APIError::invalid_argument("alias", alias, "must not be empty"));
        }
        let address = self.wallet.parse_address(off_chain_address).map_err(|e| {
            APIError::invalid_argument("off_chain_address", off_chain_address, &e.to_string())
        })?;
        let peer = Peer {
            alias: alias.to_string(),
            off_chain_address: address,
            comm_address: comm_address.to_string(),
        };
        self.contacts.write(peer.clone())?;
        info!(session = %self.id, alias, "contact added");
        Ok(peer)
    }

    /// Look up a contact. `self` resolves to the session's own user.
    pub fn get_contact(&self, alias: &str) -> Result<Peer, APIError> {
        if alias == SELF_ALIAS {
            return Ok(Peer {
                alias: SELF_ALIAS.to_string(),
                off_chain_address: self.user.off_chain.clone(),
                comm_address: self.user.comm_address.clone(),
            });
        }
        self.contacts
            .by_alias(alias)
            .ok_or_else(|| APIError::resource_not_found(resource::CONTACT, alias))
    }

    /// Peer for an address seen on the wire. Unknown addresses are reported
    /// under the address itself.
    fn peer_for(&self, address: &Address) -> Peer {
        self.contacts.by_address(address).unwrap_or_else(|| Peer {
            alias: address.to_string(),
            off_chain_address: address.clone(),
            comm_address: String::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Propose a channel to `peer_alias` and wait until it is funded.
    ///
    /// `opening_balances` must name exactly `self` and the peer.
    pub async fn open_channel(
        &self,
        ctx: &CallContext,
        peer_alias: &str,
        opening_balances: &BalanceMap,
        app: Option<AppDescriptor>,
        challenge_duration_secs: u64,
    ) -> Result<ChannelInfo, APIError> {
        self.require_open()?;
        let peer = self
            .contacts
            .by_alias(peer_alias)
            .ok_or_else(|| APIError::resource_not_found(resource::CONTACT, peer_alias))?;

        let own = opening_balances.get(SELF_ALIAS);
        let theirs = opening_balances.get(peer_alias);
        let (own, theirs) = match (own, theirs) {
            (Some(o), Some(t)) if opening_balances.len() == 2 => (o, t),
            _ => {
                let keys: Vec<&str> = opening_balances.keys().map(String::as_str).collect();
                return Err(APIError::invalid_argument(
                    "opening_balances",
                    &keys.join(","),
                    &format!("must contain exactly {} and {}", SELF_ALIAS, peer_alias),
                ));
            }
        };
        let parse = |amount: &String| {
            self.currency
                .parse(amount)
                .map_err(|e| APIError::invalid_amount(amount, &e.to_string()))
        };
        let balances = [parse(own)?, parse(theirs)?];
        if challenge_duration_secs == 0 {
            return Err(APIError::invalid_argument(
                "challenge_duration_secs",
                "0",
                "must be positive",
            ));
        }

        let proposal = ChannelProposal {
            peer: peer.off_chain_address.clone(),
            peer_comm_address: peer.comm_address.clone(),
            opening_balances: balances,
            challenge_duration_secs,
            currency: self.currency.symbol().to_string(),
            app,
        };
        let opening = self.begin_opening()?;
        debug!(session = %self.id, peer = peer_alias, "proposing channel");
        let handle = ctx
            .run(
                self.timeouts.propose(challenge_duration_secs),
                peer_alias,
                self.client.propose_channel(proposal),
            )
            .await?;

        let channel = self.adopt_channel(handle, peer).await?;
        drop(opening);
        info!(session = %self.id, channel = %channel.id(), peer = peer_alias, "channel opened");
        Ok(channel.info())
    }

    /// Add `handle` to the channel table. Hands it back if the session
    /// closed in the meantime.
    fn register_channel(
        &self,
        handle: Arc<dyn ChannelHandle>,
        peer: Peer,
    ) -> Result<Arc<ChannelSession>, Arc<dyn ChannelHandle>> {
        let mut table = self.channels.write();
        if self.is_closed() {
            return Err(handle);
        }
        if let Some(existing) = table.by_id.get(handle.id()) {
            return Ok(Arc::clone(existing));
        }
        let channel = Arc::new(ChannelSession::new(
            handle,
            peer,
            Arc::clone(&self.currency),
            self.timeouts,
        ));
        table
            .by_id
            .insert(channel.id().to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Register a freshly funded channel, or settle it when the session
    /// closed while it was being opened.
    async fn adopt_channel(
        &self,
        handle: Arc<dyn ChannelHandle>,
        peer: Peer,
    ) -> Result<Arc<ChannelSession>, APIError> {
        let handle = match self.register_channel(handle, peer) {
            Ok(channel) => return Ok(channel),
            Err(handle) => handle,
        };
        warn!(session = %self.id, channel = %handle.id(), "channel funded after session closed, settling");
        let timeout = self.timeouts.close(handle.challenge_duration_secs());
        match tokio::time::timeout(timeout, handle.settle()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %self.id, channel = %handle.id(), error = %e, "orphaned channel not settled"),
            Err(_) => warn!(session = %self.id, channel = %handle.id(), "orphaned channel settlement timed out"),
        }
        Err(self.closed_error())
    }

    /// Track a channel recovered from the client's persistence.
    pub(crate) fn restore_channel(
        &self,
        handle: Arc<dyn ChannelHandle>,
    ) -> Result<Arc<ChannelSession>, APIError> {
        let participants = handle.participants();
        let peer = self.peer_for(&participants[1 - handle.own_index()]);
        let channel = self
            .register_channel(handle, peer)
            .map_err(|_| self.closed_error())?;
        debug!(session = %self.id, channel = %channel.id(), state = %channel.lock_state(), "channel restored");
        Ok(channel)
    }

    pub fn get_channel(&self, channel_id: &str) -> Result<Arc<ChannelSession>, APIError> {
        self.channels
            .read()
            .by_id
            .get(channel_id)
            .cloned()
            .ok_or_else(|| APIError::resource_not_found(resource::CHANNEL, channel_id))
    }

    /// Snapshot of every channel the session knows, closed ones included.
    pub fn get_channels(&self) -> ChannelsSnapshot {
        let mut channels: Vec<_> = self.channels.read().by_id.values().cloned().collect();
        channels.sort_by(|a, b| a.id().cmp(b.id()));
        ChannelsSnapshot { channels }
    }

    // -----------------------------------------------------------------------
    // Proposals
    // -----------------------------------------------------------------------

    pub fn subscribe_proposals<T: Notifier<ProposalNotif>>(
        &self,
        notifier: T,
    ) -> Result<(), APIError> {
        self.require_open()?;
        self.proposal_slot
            .subscribe(notifier)
            .map_err(|e| APIError::from_subscription(e, resource::PROPOSALS_SUBSCRIPTION, &self.id))
    }

    pub async fn unsubscribe_proposals(&self) -> Result<(), APIError> {
        self.proposal_slot
            .unsubscribe()
            .await
            .map_err(|e| APIError::from_subscription(e, resource::PROPOSALS_SUBSCRIPTION, &self.id))
    }

    /// Accept or reject a pending proposal. Accepting returns the new channel.
    pub async fn respond_to_proposal(
        &self,
        ctx: &CallContext,
        proposal_id: &str,
        accept: bool,
    ) -> Result<Option<ChannelInfo>, APIError> {
        let pending = self
            .proposals
            .lock()
            .remove(proposal_id)
            .ok_or_else(|| APIError::unknown_proposal_id(proposal_id))?;
        if pending.is_expired(Instant::now()) {
            debug!(session = %self.id, proposal = proposal_id, "answer to expired proposal");
            return Err(APIError::unknown_proposal_id(proposal_id));
        }
        let alias = pending.peer.alias.clone();

        if !accept {
            ctx.run(
                self.timeouts.reject_proposal(),
                &alias,
                still_awaited(pending.responder.reject("rejected by user")),
            )
            .await?
            .ok_or_else(|| APIError::unknown_proposal_id(proposal_id))?;
            info!(session = %self.id, proposal = proposal_id, "proposal rejected");
            return Ok(None);
        }

        let opening = self.begin_opening()?;
        let handle = ctx
            .run(
                self.timeouts.accept_proposal(pending.challenge_duration_secs),
                &alias,
                still_awaited(pending.responder.accept()),
            )
            .await?
            .ok_or_else(|| APIError::unknown_proposal_id(proposal_id))?;
        let channel = self.adopt_channel(handle, pending.peer).await?;
        drop(opening);
        info!(session = %self.id, proposal = proposal_id, channel = %channel.id(), "proposal accepted");
        Ok(Some(channel.info()))
    }

    fn on_proposal(&self, proposal: IncomingProposal, responder: Box<dyn ProposalResponder>) {
        let proposal_id = proposal.proposal_id.clone();
        if self.is_closed() {
            self.reject_in_background(responder, "session is closing");
            return;
        }
        let Some(peer) = self.contacts.by_address(&proposal.proposer) else {
            warn!(session = %self.id, proposer = %proposal.proposer, "proposal from unknown peer refused");
            self.reject_in_background(responder, "unknown peer");
            return;
        };
        if proposal.currency != self.currency.symbol() {
            warn!(session = %self.id, currency = %proposal.currency, "proposal in unsupported currency refused");
            self.reject_in_background(responder, "unsupported currency");
            return;
        }

        let mut opening_balances = BalanceMap::new();
        opening_balances.insert(
            peer.alias.clone(),
            self.currency.format(proposal.opening_balances[0]),
        );
        opening_balances.insert(
            SELF_ALIAS.to_string(),
            self.currency.format(proposal.opening_balances[1]),
        );
        // The proposer waits this long for the channel to be funded.
        let valid_for = self.timeouts.propose(proposal.challenge_duration_secs);
        let notif = ProposalNotif {
            proposal_id: proposal_id.clone(),
            peer_alias: peer.alias.clone(),
            currency: proposal.currency.clone(),
            opening_balances,
            challenge_duration_secs: proposal.challenge_duration_secs,
            expiry: expiry_after(valid_for),
        };

        let now = Instant::now();
        let mut proposals = self.proposals.lock();
        proposals.retain(|id, p| {
            let keep = !p.is_expired(now);
            if !keep {
                debug!(session = %self.id, proposal = %id, "expired proposal dropped");
            }
            keep
        });
        proposals.insert(
            proposal_id.clone(),
            PendingProposal {
                peer,
                challenge_duration_secs: proposal.challenge_duration_secs,
                expires_at: now + valid_for,
                responder,
            },
        );
        if let Err(e) = self.proposal_slot.publish(notif) {
            let pending = proposals.remove(&proposal_id);
            drop(proposals);
            warn!(session = %self.id, proposal = %proposal_id, error = %e, "proposal not deliverable, rejecting");
            if let Some(p) = pending {
                self.reject_in_background(p.responder, "proposal could not be delivered");
            }
            return;
        }
        debug!(session = %self.id, proposal = %proposal_id, "proposal received");
    }

    fn reject_in_background(&self, responder: Box<dyn ProposalResponder>, reason: &'static str) {
        let timeout = self.timeouts.reject_proposal();
        let session = self.id.clone();
        tokio::spawn(async move {
            if let Ok(Err(e)) = tokio::time::timeout(timeout, responder.reject(reason)).await {
                debug!(session = %session, error = %e, "background proposal reject failed");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Updates & closes (routed from the protocol client)
    // -----------------------------------------------------------------------

    fn on_update(&self, update: IncomingUpdate, responder: Box<dyn UpdateResponder>) {
        match self.get_channel(&update.channel_id) {
            Ok(channel) => channel.on_incoming_update(update, responder),
            Err(_) => {
                warn!(session = %self.id, channel = %update.channel_id, "update for unknown channel refused");
                let timeout = self.timeouts.reject_update();
                tokio::spawn(async move {
                    let _ = tokio::time::timeout(timeout, responder.reject("unknown channel")).await;
                });
            }
        }
    }

    fn on_concluded(&self, channel_id: &str, final_state: ChannelState) {
        let Ok(channel) = self.get_channel(channel_id) else {
            debug!(session = %self.id, channel = channel_id, "conclusion of untracked channel ignored");
            return;
        };
        channel.on_concluded();

        let notif = CloseNotif {
            channel_id: channel_id.to_string(),
            currency: channel.currency_symbol().to_string(),
            closing_balances: channel.balances_of(&final_state),
            version: final_state.version.to_string(),
            error: None,
        };
        if let Err(e) = self.close_slot.publish(notif) {
            warn!(session = %self.id, channel = channel_id, error = %e, "close notification dropped");
        }
        info!(session = %self.id, channel = channel_id, "channel settled");
    }

    pub fn subscribe_closes<T: Notifier<CloseNotif>>(&self, notifier: T) -> Result<(), APIError> {
        self.require_open()?;
        self.close_slot
            .subscribe(notifier)
            .map_err(|e| APIError::from_subscription(e, resource::CLOSES_SUBSCRIPTION, &self.id))
    }

    pub async fn unsubscribe_closes(&self) -> Result<(), APIError> {
        self.close_slot
            .unsubscribe()
            .await
            .map_err(|e| APIError::from_subscription(e, resource::CLOSES_SUBSCRIPTION, &self.id))
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Shut the session down.
    ///
    /// Without `force`, fails while any channel is not `Closed` or is still
    /// being opened. On success every subscription ends, pending proposals
    /// are rejected, the protocol client stops, and the channels that were
    /// still open are returned.
    pub async fn close(&self, force: bool) -> Result<Vec<ChannelInfo>, APIError> {
        let open = {
            let table = self.channels.write();
            if self.is_closed() {
                return Err(self.closed_error());
            }
            let mut open: Vec<Arc<ChannelSession>> = table
                .by_id
                .values()
                .filter(|c| c.lock_state() != LockState::Closed)
                .cloned()
                .collect();
            open.sort_by(|a, b| a.id().cmp(b.id()));
            if !force && !open.is_empty() {
                return Err(APIError::unclosed_channels(
                    open.iter().map(|c| c.id().to_string()).collect(),
                ));
            }
            if !force && table.opening > 0 {
                return Err(APIError::failed_pre_condition(format!(
                    "session {} has {} channel(s) being opened",
                    self.id, table.opening
                )));
            }
            self.closed.store(true, Ordering::SeqCst);
            open
        };

        self.proposal_slot.close().await;
        self.close_slot.close().await;
        let channels: Vec<_> = self.channels.read().by_id.values().cloned().collect();
        for channel in &channels {
            channel.close_subscriptions().await;
        }

        let pending: Vec<(String, PendingProposal)> = self.proposals.lock().drain().collect();
        for (proposal_id, p) in pending {
            let res = tokio::time::timeout(
                self.timeouts.reject_proposal(),
                p.responder.reject("session closed"),
            )
            .await;
            if !matches!(res, Ok(Ok(()))) {
                debug!(session = %self.id, proposal = %proposal_id, "pending proposal not rejected cleanly");
            }
        }

        if let Err(e) = self.client.close().await {
            warn!(session = %self.id, error = %e, "protocol client did not shut down cleanly");
        }
        info!(session = %self.id, force, still_open = open.len(), "session closed");
        Ok(open.iter().map(|c| c.info()).collect())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user.name)
            .field("channels", &self.channels.read().by_id.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Restartable, read-only view over a session's channels at one instant.
#[derive(Clone, Debug)]
pub struct ChannelsSnapshot {
    channels: Vec<Arc<ChannelSession>>,
}

impl ChannelsSnapshot {
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channel infos, computed lazily. Each call starts from the beginning.
    pub fn iter(&self) -> impl Iterator<Item = ChannelInfo> + '_ {
        self.channels.iter().map(|c| c.info())
    }
}

/// Routes protocol events to the session, if it still exists.
struct EventRouter {
    session: Weak<Session>,
}

impl ProtocolEventHandler for EventRouter {
    fn handle_proposal(&self, proposal: IncomingProposal, responder: Box<dyn ProposalResponder>) {
        match self.session.upgrade() {
            Some(s) => s.on_proposal(proposal, responder),
            None => drop(responder),
        }
    }

    fn handle_update(&self, update: IncomingUpdate, responder: Box<dyn UpdateResponder>) {
        match self.session.upgrade() {
            Some(s) => s.on_update(update, responder),
            None => drop(responder),
        }
    }

    fn handle_concluded(&self, channel_id: &str, final_state: ChannelState) {
        if let Some(s) = self.session.upgrade() {
            s.on_concluded(channel_id, final_state);
        }
    }
}
