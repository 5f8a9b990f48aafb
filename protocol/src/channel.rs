//! # Channel Session
//!
//! One open payment channel inside a session: sends and answers state
//! updates, owns the update notification slot, and drives the channel
//! through its lock states.
//!
//! ```text
//!   Open ──close / accept final update──► Finalized ──settled──► Closed
//! ```
//!
//! Transitions only move forward. Every mutating operation except `close`
//! requires `Open`. A `ChannelSession` is never removed from its session,
//! so a closed channel can still be queried.
//!
//! At most one incoming update waits for an answer at a time. It is keyed
//! by `"<channel_id>_<version>"` and removed before the answer is sent, so a
//! second answer for the same id always fails with `ResourceNotFound`. So
//! does an answer after the sender stopped waiting: a pending update lives
//! for the sender's update deadline and is replaced by the next incoming
//! update once that has passed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ChannelHandle, ChannelState, ClientError, IncomingUpdate, UpdateResponder};
use crate::config::SELF_ALIAS;
use crate::contacts::Peer;
use crate::context::CallContext;
use crate::currency::CurrencyParser;
use crate::error::{resource, APIError};
use crate::notification::{BalanceMap, UpdateNotif};
use crate::subscription::{Notifier, SubscriptionSlot};
use crate::timeout::TimeoutConfig;

/// Where a channel is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Accepting updates.
    Open,
    /// A final state was agreed or is being agreed; awaiting settlement.
    Finalized,
    /// Settled on-chain.
    Closed,
}

impl LockState {
    /// The state a recovered channel handle is in.
    pub fn of(handle: &dyn ChannelHandle) -> Self {
        if handle.is_concluded() {
            LockState::Closed
        } else if handle.state().is_final {
            LockState::Finalized
        } else {
            LockState::Open
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockState::Open => "open",
            LockState::Finalized => "finalized",
            LockState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a channel as reported to API callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub peer_alias: String,
    pub currency: String,
    /// Alias → formatted balance, with the local user as `self`.
    pub balances: BalanceMap,
    pub version: String,
    pub lock_state: LockState,
}

struct PendingUpdate {
    update_id: String,
    proposed: ChannelState,
    expires_at: Instant,
    responder: Box<dyn UpdateResponder>,
}

impl PendingUpdate {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct ChannelInner {
    lock_state: LockState,
    pending: Option<PendingUpdate>,
}

/// A channel owned by a session.
pub struct ChannelSession {
    id: String,
    peer: Peer,
    handle: Arc<dyn ChannelHandle>,
    currency: Arc<dyn CurrencyParser>,
    timeouts: TimeoutConfig,
    updates: SubscriptionSlot<UpdateNotif>,
    inner: Mutex<ChannelInner>,
}

impl ChannelSession {
    pub(crate) fn new(
        handle: Arc<dyn ChannelHandle>,
        peer: Peer,
        currency: Arc<dyn CurrencyParser>,
        timeouts: TimeoutConfig,
    ) -> Self {
        let id = handle.id().to_string();
        let lock_state = LockState::of(handle.as_ref());
        Self {
            updates: SubscriptionSlot::new(format!("updates:{}", id)),
            id,
            peer,
            handle,
            currency,
            timeouts,
            inner: Mutex::new(ChannelInner {
                lock_state,
                pending: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn lock_state(&self) -> LockState {
        self.inner.lock().lock_state
    }

    /// Current balances, version and lock state. Equivalent of GetBalance.
    pub fn info(&self) -> ChannelInfo {
        let lock_state = self.lock_state();
        let state = self.handle.state();
        ChannelInfo {
            channel_id: self.id.clone(),
            peer_alias: self.peer.alias.clone(),
            currency: self.currency.symbol().to_string(),
            balances: self.balance_map(&state),
            version: state.version.to_string(),
            lock_state,
        }
    }

    /// Current balances, with the local user as `self`.
    pub fn balance(&self) -> BalanceMap {
        self.balance_map(&self.handle.state())
    }

    fn balance_map(&self, state: &ChannelState) -> BalanceMap {
        let own = self.handle.own_index();
        let mut balances = BalanceMap::new();
        balances.insert(
            SELF_ALIAS.to_string(),
            self.currency.format(state.balances[own]),
        );
        balances.insert(
            self.peer.alias.clone(),
            self.currency.format(state.balances[1 - own]),
        );
        balances
    }

    fn require_open(&self) -> Result<(), APIError> {
        match self.lock_state() {
            LockState::Open => Ok(()),
            other => Err(APIError::failed_pre_condition(format!(
                "channel {} is {}",
                self.id, other
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Outgoing updates
    // -----------------------------------------------------------------------

    /// Move `amount` to `payee`, which is either `self` (the peer pays) or
    /// the peer's alias (we pay). Validation happens before any protocol call.
    pub async fn send_update(
        &self,
        ctx: &CallContext,
        payee: &str,
        amount: &str,
    ) -> Result<ChannelInfo, APIError> {
        let own = self.handle.own_index();
        let other = 1 - own;
        let (payer, receiver) = if payee == SELF_ALIAS {
            (other, own)
        } else if payee == self.peer.alias {
            (own, other)
        } else {
            return Err(APIError::invalid_payee(payee));
        };

        let value = self
            .currency
            .parse(amount)
            .map_err(|e| APIError::invalid_amount(amount, &e.to_string()))?;
        if value == 0 {
            return Err(APIError::invalid_amount(amount, "must be greater than zero"));
        }
        self.require_open()?;

        let current = self.handle.state();
        let available = current.balances[payer];
        if available < value {
            return Err(APIError::insufficient_balance(
                &self.currency.format(available),
                &self.currency.format(value),
            ));
        }
        let mut balances = current.balances;
        balances[payer] = available - value;
        balances[receiver] = balances[receiver]
            .checked_add(value)
            .ok_or_else(|| APIError::invalid_amount(amount, "balance would overflow"))?;

        let next = current.next(balances);
        ctx.run(
            self.timeouts.send_update(),
            &self.peer.alias,
            self.handle.update(next),
        )
        .await?;

        info!(channel = %self.id, payee, amount, version = next.version, "update sent");
        Ok(self.info())
    }

    // -----------------------------------------------------------------------
    // Incoming updates
    // -----------------------------------------------------------------------

    pub fn subscribe_updates<T: Notifier<UpdateNotif>>(&self, notifier: T) -> Result<(), APIError> {
        if self.lock_state() == LockState::Closed {
            return Err(APIError::failed_pre_condition(format!(
                "channel {} is closed",
                self.id
            )));
        }
        self.updates
            .subscribe(notifier)
            .map_err(|e| APIError::from_subscription(e, resource::UPDATES_SUBSCRIPTION, &self.id))
    }

    pub async fn unsubscribe_updates(&self) -> Result<(), APIError> {
        self.updates
            .unsubscribe()
            .await
            .map_err(|e| APIError::from_subscription(e, resource::UPDATES_SUBSCRIPTION, &self.id))
    }

    /// Called from the protocol event handler. Must not block.
    pub(crate) fn on_incoming_update(
        &self,
        update: IncomingUpdate,
        responder: Box<dyn UpdateResponder>,
    ) {
        let proposed = update.proposed;
        let update_id = format!("{}_{}", self.id, proposed.version);

        let mut inner = self.inner.lock();
        if inner.lock_state != LockState::Open {
            drop(inner);
            debug!(channel = %self.id, update = %update_id, "update on non-open channel refused");
            self.reject_in_background(responder, "channel is not open");
            return;
        }
        if inner.pending.as_ref().is_some_and(PendingUpdate::is_expired) {
            if let Some(stale) = inner.pending.take() {
                debug!(channel = %self.id, update = %stale.update_id, "expired update dropped");
            }
        }
        if inner.pending.is_some() {
            drop(inner);
            debug!(channel = %self.id, update = %update_id, "update refused, another is pending");
            self.reject_in_background(responder, "another update is pending");
            return;
        }

        let valid_for = self.timeouts.send_update();
        let notif = UpdateNotif {
            update_id: update_id.clone(),
            channel_id: self.id.clone(),
            currency: self.currency.symbol().to_string(),
            proposed_balances: self.balance_map(&proposed),
            version: proposed.version.to_string(),
            is_final: proposed.is_final,
            expiry: expiry_after(valid_for),
        };
        inner.pending = Some(PendingUpdate {
            update_id: update_id.clone(),
            proposed,
            expires_at: Instant::now() + valid_for,
            responder,
        });

        if let Err(e) = self.updates.publish(notif) {
            let pending = inner.pending.take();
            drop(inner);
            warn!(channel = %self.id, update = %update_id, error = %e, "update not deliverable, rejecting");
            if let Some(p) = pending {
                self.reject_in_background(p.responder, "update could not be delivered");
            }
            return;
        }
        debug!(channel = %self.id, update = %update_id, is_final = proposed.is_final, "update received");
    }

    /// Accept or reject the pending incoming update `update_id`.
    pub async fn respond_to_update(
        &self,
        ctx: &CallContext,
        update_id: &str,
        accept: bool,
    ) -> Result<ChannelInfo, APIError> {
        let pending = {
            let mut inner = self.inner.lock();
            match inner.pending.take() {
                Some(p) if p.update_id == update_id && !p.is_expired() => p,
                Some(p) if p.update_id == update_id => {
                    debug!(channel = %self.id, update = %update_id, "answer to expired update");
                    return Err(APIError::unknown_update_id(update_id));
                }
                other => {
                    inner.pending = other;
                    return Err(APIError::unknown_update_id(update_id));
                }
            }
        };

        if accept {
            let answered = ctx
                .run(
                    self.timeouts.accept_update(),
                    &self.peer.alias,
                    still_awaited(pending.responder.accept()),
                )
                .await?;
            if answered.is_none() {
                return Err(APIError::unknown_update_id(update_id));
            }
            if pending.proposed.is_final {
                let mut inner = self.inner.lock();
                if inner.lock_state == LockState::Open {
                    inner.lock_state = LockState::Finalized;
                }
            }
            info!(channel = %self.id, update = %update_id, "update accepted");
        } else {
            let answered = ctx
                .run(
                    self.timeouts.reject_update(),
                    &self.peer.alias,
                    still_awaited(pending.responder.reject("rejected by user")),
                )
                .await?;
            if answered.is_none() {
                return Err(APIError::unknown_update_id(update_id));
            }
            info!(channel = %self.id, update = %update_id, "update rejected");
        }
        Ok(self.info())
    }

    fn reject_in_background(&self, responder: Box<dyn UpdateResponder>, reason: &'static str) {
        let timeout = self.timeouts.reject_update();
        let channel = self.id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, responder.reject(reason)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(channel = %channel, error = %e, "background reject failed"),
                Err(_) => debug!(channel = %channel, "background reject timed out"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Finalize and settle the channel.
    ///
    /// A peer refusing the final update does not stop the close: the latest
    /// agreed state is settled instead. If settlement fails the channel stays
    /// `Finalized` and `close` may be called again.
    pub async fn close(&self, ctx: &CallContext) -> Result<ChannelInfo, APIError> {
        let pending = {
            let mut inner = self.inner.lock();
            match inner.lock_state {
                LockState::Closed => {
                    return Err(APIError::failed_pre_condition(format!(
                        "channel {} is already closed",
                        self.id
                    )))
                }
                LockState::Open => inner.lock_state = LockState::Finalized,
                LockState::Finalized => {}
            }
            inner.pending.take()
        };
        if let Some(p) = pending {
            self.reject_in_background(p.responder, "channel is closing");
        }

        let close_timeout = self.timeouts.close(self.handle.challenge_duration_secs());
        let ctx = CallContext::with_deadline(ctx.bound(close_timeout));

        let current = self.handle.state();
        if !current.is_final {
            match ctx
                .run(
                    self.timeouts.send_update(),
                    &self.peer.alias,
                    self.handle.update(current.finalized()),
                )
                .await
            {
                Ok(()) => debug!(channel = %self.id, "final state agreed"),
                Err(e) => warn!(
                    channel = %self.id,
                    error = %e,
                    "finalizing update failed, settling latest agreed state"
                ),
            }
        }

        ctx.run(close_timeout, &self.peer.alias, self.handle.settle())
            .await?;

        self.mark_closed();
        self.updates.close().await;
        info!(channel = %self.id, "channel closed");
        Ok(self.info())
    }

    fn mark_closed(&self) {
        self.inner.lock().lock_state = LockState::Closed;
    }

    /// Settlement observed on-chain, whoever initiated it. Ends the update
    /// subscription and refuses any pending update.
    pub(crate) fn on_concluded(self: &Arc<Self>) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.lock_state = LockState::Closed;
            inner.pending.take()
        };
        if let Some(p) = pending {
            self.reject_in_background(p.responder, "channel concluded");
        }
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            channel.updates.close().await;
        });
        debug!(channel = %self.id, "conclusion observed");
    }

    /// Release the update slot. Used when the owning session closes.
    pub(crate) async fn close_subscriptions(&self) {
        self.updates.close().await;
    }

    /// Final-state balances, for close notifications.
    pub(crate) fn balances_of(&self, state: &ChannelState) -> BalanceMap {
        self.balance_map(state)
    }

    pub(crate) fn currency_symbol(&self) -> &str {
        self.currency.symbol()
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("id", &self.id)
            .field("peer", &self.peer.alias)
            .field("lock_state", &self.lock_state())
            .finish()
    }
}

/// Resolves to `None` when the responder reports that the other side
/// stopped waiting for the answer.
pub(crate) async fn still_awaited<T, F>(answer: F) -> Result<Option<T>, ClientError>
where
    F: std::future::Future<Output = Result<T, ClientError>>,
{
    match answer.await {
        Ok(value) => Ok(Some(value)),
        Err(ClientError::Expired) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn expiry_after(timeout: Duration) -> chrono::DateTime<Utc> {
    let delta = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + delta
}
