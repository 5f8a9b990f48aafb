// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # paynode: Session & Channel Core
//!
//! The part of a payment-channel node that sits between an API surface and a
//! state-channel protocol library. It tracks sessions and their channels,
//! turns asynchronous protocol events into ordered notifications for exactly
//! one subscriber per stream, bounds every protocol call with a deadline, and
//! classifies every failure into a small, stable error taxonomy.
//!
//! ## Architecture
//!
//! - **node**: registry of open sessions; validates session configs.
//! - **session**: one user, with contacts, channels, proposal and close streams.
//! - **channel**: one channel, with payments, incoming updates, close.
//! - **subscription**: single-subscriber notification slot.
//! - **timeout**: per-operation deadlines.
//! - **error**: the `APIError` taxonomy.
//! - **client**: traits for the protocol, chain and wallet backends.
//! - **sim**: in-process implementation of those traits.
//! - **config**, **currency**, **contacts**, **context**, **notification**:
//!   supporting types.

pub mod channel;
pub mod client;
pub mod config;
pub mod contacts;
pub mod context;
pub mod currency;
pub mod error;
pub mod node;
pub mod notification;
pub mod session;
pub mod sim;
pub mod subscription;
pub mod timeout;

pub use channel::{ChannelInfo, ChannelSession, LockState};
pub use context::CallContext;
pub use error::{APIError, ErrorCategory, ErrorCode, ErrorDetail};
pub use node::Node;
pub use session::{ChannelsSnapshot, Session};
pub use subscription::{DeliveryError, Notifier, SubscriptionError};
