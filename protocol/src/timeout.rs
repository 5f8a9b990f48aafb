//! # Operation Deadlines
//!
//! Every call into the channel protocol is bounded by a deadline derived from
//! three parameters: how long a peer gets to respond off-chain, how long an
//! on-chain transaction gets to be mined, and a local processing margin.
//!
//! The multipliers upper-bound the round trips and on-chain confirmations the
//! protocol performs for each operation:
//!
//! | Operation        | Deadline                                             |
//! |------------------|------------------------------------------------------|
//! | propose          | 3×response + 2×on-chain tx + challenge + margin      |
//! | accept proposal  | same as propose                                      |
//! | reject proposal  | response + margin                                    |
//! | send update      | response + margin                                    |
//! | accept update    | response + margin                                    |
//! | reject update    | response + margin                                    |
//! | close            | response + 3×on-chain tx + challenge + margin        |

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The protocol operations that get their own deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Propose,
    AcceptProposal,
    RejectProposal,
    SendUpdate,
    AcceptUpdate,
    RejectUpdate,
    Close,
}

/// Input parameters of the timeout calculation. Pure data, no state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Time a peer has to answer an off-chain request.
    pub response: Duration,
    /// Time an on-chain transaction has to be confirmed.
    pub on_chain_tx: Duration,
    /// Local processing slack.
    pub processing_margin: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            response: crate::config::DEFAULT_RESPONSE_TIMEOUT,
            on_chain_tx: crate::config::DEFAULT_ON_CHAIN_TX_TIMEOUT,
            processing_margin: crate::config::DEFAULT_PROCESSING_MARGIN,
        }
    }
}

impl TimeoutConfig {
    /// Deadline for `op`. `challenge_dur_secs` only affects the operations
    /// that may wait out a dispute window (propose, accept proposal, close).
    pub fn for_operation(&self, op: Operation, challenge_dur_secs: u64) -> Duration {
        let challenge = Duration::from_secs(challenge_dur_secs);
        let base = match op {
            Operation::Propose | Operation::AcceptProposal => self
                .response
                .saturating_mul(3)
                .saturating_add(self.on_chain_tx.saturating_mul(2))
                .saturating_add(challenge),
            Operation::RejectProposal
            | Operation::SendUpdate
            | Operation::AcceptUpdate
            | Operation::RejectUpdate => self.response,
            Operation::Close => self
                .response
                .saturating_add(self.on_chain_tx.saturating_mul(3))
                .saturating_add(challenge),
        };
        base.saturating_add(self.processing_margin)
    }

    pub fn propose(&self, challenge_dur_secs: u64) -> Duration {
        self.for_operation(Operation::Propose, challenge_dur_secs)
    }

    pub fn accept_proposal(&self, challenge_dur_secs: u64) -> Duration {
        self.for_operation(Operation::AcceptProposal, challenge_dur_secs)
    }

    pub fn reject_proposal(&self) -> Duration {
        self.for_operation(Operation::RejectProposal, 0)
    }

    pub fn send_update(&self) -> Duration {
        self.for_operation(Operation::SendUpdate, 0)
    }

    pub fn accept_update(&self) -> Duration {
        self.for_operation(Operation::AcceptUpdate, 0)
    }

    pub fn reject_update(&self) -> Duration {
        self.for_operation(Operation::RejectUpdate, 0)
    }

    pub fn close(&self, challenge_dur_secs: u64) -> Duration {
        self.for_operation(Operation::Close, challenge_dur_secs)
    }
}
