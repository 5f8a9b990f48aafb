//! Sim protocol client, channel handles and responders.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::debug;

use super::NetInner;
use crate::client::{
    Address, ChannelClient, ChannelHandle, ChannelProposal, ChannelState, ClientError,
    IncomingProposal, IncomingUpdate, ProposalResponder, ProtocolEventHandler, UpdateResponder,
    UserIdentity,
};

/// A connected participant.
pub(crate) struct Party {
    address: Address,
    handler: RwLock<Option<Arc<dyn ProtocolEventHandler>>>,
}

impl Party {
    fn handler(&self) -> Option<Arc<dyn ProtocolEventHandler>> {
        self.handler.read().clone()
    }
}

/// Shared state of one channel, seen by both participants.
pub(crate) struct ChannelCore {
    id: String,
    participants: [Address; 2],
    challenge_duration_secs: u64,
    currency: String,
    state: Mutex<ChannelState>,
    concluded: AtomicBool,
}

fn channel_id(proposer: &Address, acceptor: &Address, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(proposer.as_str().as_bytes());
    hasher.update(acceptor.as_str().as_bytes());
    hasher.update(nonce.to_be_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

impl NetInner {
    fn handler_of(&self, address: &Address) -> Option<Arc<dyn ProtocolEventHandler>> {
        self.parties.get(address).and_then(|p| p.handler())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Protocol client of one party on a [`SimNetwork`](super::SimNetwork).
pub struct SimClient {
    net: Arc<NetInner>,
    party: Arc<Party>,
}

impl SimClient {
    pub(crate) fn connect(net: Arc<NetInner>, user: &UserIdentity) -> Result<Arc<Self>, ClientError> {
        let party = Arc::new(Party {
            address: user.off_chain.clone(),
            handler: RwLock::new(None),
        });
        match net.parties.entry(user.off_chain.clone()) {
            Entry::Occupied(_) => {
                return Err(ClientError::Other(format!(
                    "{} is already connected",
                    user.off_chain
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&party));
            }
        }
        Ok(Arc::new(Self { net, party }))
    }

    fn handle_for(&self, core: Arc<ChannelCore>) -> Option<Arc<dyn ChannelHandle>> {
        let own_index = core
            .participants
            .iter()
            .position(|a| a == &self.party.address)?;
        Some(Arc::new(SimChannel {
            core,
            own_index,
            net: Arc::clone(&self.net),
        }))
    }
}

#[async_trait]
impl ChannelClient for SimClient {
    fn address(&self) -> &Address {
        &self.party.address
    }

    fn set_handler(&self, handler: Arc<dyn ProtocolEventHandler>) {
        *self.party.handler.write() = Some(handler);
    }

    async fn propose_channel(
        &self,
        proposal: ChannelProposal,
    ) -> Result<Arc<dyn ChannelHandle>, ClientError> {
        self.net.counters.propose.fetch_add(1, Ordering::SeqCst);
        let handler = self
            .net
            .handler_of(&proposal.peer)
            .ok_or_else(|| ClientError::PeerUnreachable(proposal.peer_comm_address.clone()))?;

        let (reply, answer) = oneshot::channel();
        let incoming = IncomingProposal {
            proposal_id: format!("{:016x}", rand::random::<u64>()),
            proposer: self.party.address.clone(),
            opening_balances: proposal.opening_balances,
            challenge_duration_secs: proposal.challenge_duration_secs,
            currency: proposal.currency.clone(),
            app: proposal.app.clone(),
        };
        let responder = SimProposalResponder {
            net: Arc::clone(&self.net),
            participants: [self.party.address.clone(), proposal.peer.clone()],
            proposal,
            reply,
        };
        debug!(proposal = %incoming.proposal_id, "sim proposal sent");
        handler.handle_proposal(incoming, Box::new(responder));

        match answer.await {
            Ok(Ok(core)) => Ok(Arc::new(SimChannel {
                core,
                own_index: 0,
                net: Arc::clone(&self.net),
            })),
            Ok(Err(reason)) => Err(ClientError::Rejected(reason)),
            Err(_) => Err(ClientError::Rejected("proposal dropped".to_string())),
        }
    }

    fn channel(&self, id: &str) -> Result<Arc<dyn ChannelHandle>, ClientError> {
        self.net
            .channels
            .get(id)
            .map(|c| Arc::clone(c.value()))
            .and_then(|core| self.handle_for(core))
            .ok_or_else(|| ClientError::UnknownChannel(id.to_string()))
    }

    async fn restore_channels(&self) -> Result<Vec<Arc<dyn ChannelHandle>>, ClientError> {
        let cores: Vec<Arc<ChannelCore>> = self
            .net
            .channels
            .iter()
            .filter(|c| !c.concluded.load(Ordering::SeqCst))
            .map(|c| Arc::clone(c.value()))
            .collect();
        Ok(cores
            .into_iter()
            .filter_map(|core| self.handle_for(core))
            .collect())
    }

    async fn close(&self) -> Result<(), ClientError> {
        *self.party.handler.write() = None;
        self.net
            .parties
            .remove_if(&self.party.address, |_, p| Arc::ptr_eq(p, &self.party));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel handle
// ---------------------------------------------------------------------------

struct SimChannel {
    core: Arc<ChannelCore>,
    own_index: usize,
    net: Arc<NetInner>,
}

#[async_trait]
impl ChannelHandle for SimChannel {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn own_index(&self) -> usize {
        self.own_index
    }

    fn participants(&self) -> [Address; 2] {
        self.core.participants.clone()
    }

    fn state(&self) -> ChannelState {
        *self.core.state.lock()
    }

    fn challenge_duration_secs(&self) -> u64 {
        self.core.challenge_duration_secs
    }

    fn currency(&self) -> &str {
        &self.core.currency
    }

    fn is_concluded(&self) -> bool {
        self.core.concluded.load(Ordering::SeqCst)
    }

    async fn update(&self, next: ChannelState) -> Result<(), ClientError> {
        self.net.counters.update.fetch_add(1, Ordering::SeqCst);
        if self.is_concluded() {
            return Err(ClientError::Other(format!("channel {} concluded", self.core.id)));
        }
        {
            let current = self.core.state.lock();
            if next.version != current.version + 1 || next.total() != current.total() {
                return Err(ClientError::Other("invalid state transition".to_string()));
            }
        }

        let peer = &self.core.participants[1 - self.own_index];
        let handler = self
            .net
            .handler_of(peer)
            .ok_or_else(|| ClientError::PeerUnreachable(peer.to_string()))?;
        let (reply, answer) = oneshot::channel();
        handler.handle_update(
            IncomingUpdate {
                channel_id: self.core.id.clone(),
                proposed: next,
            },
            Box::new(SimUpdateResponder {
                core: Arc::clone(&self.core),
                next,
                reply,
            }),
        );

        match answer.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ClientError::Rejected(reason)),
            Err(_) => Err(ClientError::Rejected("update dropped".to_string())),
        }
    }

    async fn settle(&self) -> Result<(), ClientError> {
        self.net.counters.settle.fetch_add(1, Ordering::SeqCst);
        if !self.net.chain_reachable() {
            return Err(ClientError::ChainUnreachable("sim chain offline".to_string()));
        }
        if self.core.concluded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let final_state = self.state();
        debug!(channel = %self.core.id, version = final_state.version, "sim channel settled");
        for participant in &self.core.participants {
            if let Some(handler) = self.net.handler_of(participant) {
                handler.handle_concluded(&self.core.id, final_state);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Responders
// ---------------------------------------------------------------------------

struct SimProposalResponder {
    net: Arc<NetInner>,
    participants: [Address; 2],
    proposal: ChannelProposal,
    reply: oneshot::Sender<Result<Arc<ChannelCore>, String>>,
}

#[async_trait]
impl ProposalResponder for SimProposalResponder {
    async fn accept(self: Box<Self>) -> Result<Arc<dyn ChannelHandle>, ClientError> {
        let SimProposalResponder {
            net,
            participants: [proposer, acceptor],
            proposal,
            reply,
        } = *self;
        if reply.is_closed() {
            return Err(ClientError::Expired);
        }
        let id = channel_id(&proposer, &acceptor, rand::random());
        let core = Arc::new(ChannelCore {
            id: id.clone(),
            participants: [proposer, acceptor],
            challenge_duration_secs: proposal.challenge_duration_secs,
            currency: proposal.currency,
            state: Mutex::new(ChannelState::initial(proposal.opening_balances)),
            concluded: AtomicBool::new(false),
        });
        net.channels.insert(id.clone(), Arc::clone(&core));
        if reply.send(Ok(Arc::clone(&core))).is_err() {
            net.channels.remove(&id);
            return Err(ClientError::Expired);
        }
        Ok(Arc::new(SimChannel {
            core,
            own_index: 1,
            net,
        }))
    }

    async fn reject(self: Box<Self>, reason: &str) -> Result<(), ClientError> {
        self.reply
            .send(Err(reason.to_string()))
            .map_err(|_| ClientError::Expired)
    }
}

struct SimUpdateResponder {
    core: Arc<ChannelCore>,
    next: ChannelState,
    reply: oneshot::Sender<Result<(), String>>,
}

#[async_trait]
impl UpdateResponder for SimUpdateResponder {
    async fn accept(self: Box<Self>) -> Result<(), ClientError> {
        let SimUpdateResponder { core, next, reply } = *self;
        if reply.is_closed() {
            return Err(ClientError::Expired);
        }
        let previous = {
            let mut state = core.state.lock();
            if core.concluded.load(Ordering::SeqCst) || next.version != state.version + 1 {
                return Err(ClientError::Other("update no longer applicable".to_string()));
            }
            std::mem::replace(&mut *state, next)
        };
        if reply.send(Ok(())).is_err() {
            *core.state.lock() = previous;
            return Err(ClientError::Expired);
        }
        Ok(())
    }

    async fn reject(self: Box<Self>, reason: &str) -> Result<(), ClientError> {
        self.reply
            .send(Err(reason.to_string()))
            .map_err(|_| ClientError::Expired)
    }
}
