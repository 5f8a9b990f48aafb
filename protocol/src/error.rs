//! # API Error Taxonomy
//!
//! Every public session and channel operation returns either its result or
//! exactly one [`APIError`]. The error carries:
//!
//! - a **category** telling the caller who has to act
//!   (the peer, the caller, a human operator, or nobody in particular);
//! - a numeric **code** from a closed set, stable across releases;
//! - a human-readable **message**;
//! - a structured **detail** with enough context to build a retry decision.
//!
//! Backend errors ([`ClientError`]) are classified where they happen and
//! never leak out raw. Their original text survives in the detail.
//!
//! | Category      | Codes   | Who acts                                   |
//! |---------------|---------|--------------------------------------------|
//! | Participant   | 101-104 | the peer misbehaved or is slow; retry later |
//! | Client        | 111-117 | the request itself is wrong; fix and retry  |
//! | ProtocolFatal | 121-123 | manual remediation, never auto-retried      |
//! | Internal      | 131-132 | node bug or transport failure               |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::contacts::ContactsError;
use crate::subscription::SubscriptionError;

/// Resource type names used in `ResourceNotFound` / `ResourceExists` details.
pub mod resource {
    pub const SESSION: &str = "session";
    pub const CHANNEL: &str = "channel";
    pub const CONTACT: &str = "contact";
    pub const PROPOSAL: &str = "proposal";
    pub const UPDATE: &str = "update";
    pub const CURRENCY: &str = "currency";
    pub const PROPOSALS_SUBSCRIPTION: &str = "proposals_subscription";
    pub const UPDATES_SUBSCRIPTION: &str = "updates_subscription";
    pub const CLOSES_SUBSCRIPTION: &str = "closes_subscription";
}

// ---------------------------------------------------------------------------
// Category & Code
// ---------------------------------------------------------------------------

/// Who is expected to act on an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Participant,
    Client,
    ProtocolFatal,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Participant => "participant",
            ErrorCategory::Client => "client",
            ErrorCategory::ProtocolFatal => "protocol_fatal",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The closed set of error codes. The numeric value is part of the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    PeerResponseTimedOut = 101,
    RejectedByPeer = 102,
    PeerNotFunded = 103,
    UserResponseTimedOut = 104,

    ResourceNotFound = 111,
    ResourceExists = 112,
    InvalidArgument = 113,
    FailedPreCondition = 114,
    InvalidConfig = 115,
    InvalidContracts = 116,
    InsufficientBalance = 117,

    TxTimedOut = 121,
    ChainNotReachable = 122,
    ChannelDisputed = 123,

    UnknownInternal = 131,
    OffChainCommFailure = 132,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 16] = [
        ErrorCode::PeerResponseTimedOut,
        ErrorCode::RejectedByPeer,
        ErrorCode::PeerNotFunded,
        ErrorCode::UserResponseTimedOut,
        ErrorCode::ResourceNotFound,
        ErrorCode::ResourceExists,
        ErrorCode::InvalidArgument,
        ErrorCode::FailedPreCondition,
        ErrorCode::InvalidConfig,
        ErrorCode::InvalidContracts,
        ErrorCode::InsufficientBalance,
        ErrorCode::TxTimedOut,
        ErrorCode::ChainNotReachable,
        ErrorCode::ChannelDisputed,
        ErrorCode::UnknownInternal,
        ErrorCode::OffChainCommFailure,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_u16() == value)
    }

    /// Every code belongs to exactly one category.
    pub fn category(self) -> ErrorCategory {
        match self.as_u16() {
            101..=110 => ErrorCategory::Participant,
            111..=120 => ErrorCategory::Client,
            121..=130 => ErrorCategory::ProtocolFatal,
            _ => ErrorCategory::Internal,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u16::deserialize(deserializer)?;
        ErrorCode::from_u16(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code {}", raw)))
    }
}

// ---------------------------------------------------------------------------
// Detail
// ---------------------------------------------------------------------------

/// Structured context attached to an [`APIError`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDetail {
    PeerResponseTimedOut {
        peer_alias: String,
        timeout_ms: u64,
    },
    RejectedByPeer {
        peer_alias: String,
        reason: String,
    },
    PeerNotFunded {
        peer_alias: String,
    },
    UserResponseTimedOut {
        cause: String,
    },
    ResourceNotFound {
        resource_type: String,
        resource_id: String,
    },
    ResourceExists {
        resource_type: String,
        resource_id: String,
    },
    InvalidArgument {
        name: String,
        value: String,
        requirement: String,
    },
    FailedPreCondition {
        reason: String,
        /// Channels that prevented the operation, when applicable.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        open_channels: Vec<String>,
    },
    InvalidConfig {
        name: String,
        value: String,
    },
    InvalidContracts {
        cause: String,
    },
    InsufficientBalance {
        available: String,
        required: String,
    },
    TxTimedOut {
        cause: String,
    },
    ChainNotReachable {
        cause: String,
    },
    Protocol {
        cause: String,
    },
}

// ---------------------------------------------------------------------------
// APIError
// ---------------------------------------------------------------------------

/// The single error type crossing the core's public boundary.
///
/// Constructed at the point of failure and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{category}/{}: {message}", .code.as_u16())]
pub struct APIError {
    category: ErrorCategory,
    code: ErrorCode,
    message: String,
    detail: ErrorDetail,
}

impl APIError {
    fn new(code: ErrorCode, message: impl Into<String>, detail: ErrorDetail) -> Self {
        Self {
            category: code.category(),
            code,
            message: message.into(),
            detail,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> &ErrorDetail {
        &self.detail
    }

    // -- Participant --------------------------------------------------------

    pub fn peer_response_timed_out(peer_alias: &str, timeout: Duration) -> Self {
        Self::new(
            ErrorCode::PeerResponseTimedOut,
            format!("no response from peer {} within {:?}", peer_alias, timeout),
            ErrorDetail::PeerResponseTimedOut {
                peer_alias: peer_alias.to_string(),
                timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
            },
        )
    }

    pub fn rejected_by_peer(peer_alias: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::RejectedByPeer,
            format!("peer {} rejected the request", peer_alias),
            ErrorDetail::RejectedByPeer {
                peer_alias: peer_alias.to_string(),
                reason: reason.to_string(),
            },
        )
    }

    // -- Client -------------------------------------------------------------

    pub fn resource_not_found(resource_type: &str, resource_id: &str) -> Self {
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("{} {} not found", resource_type, resource_id),
            ErrorDetail::ResourceNotFound {
                resource_type: resource_type.to_string(),
                resource_id: resource_id.to_string(),
            },
        )
    }

    /// No pending proposal with this id: already answered, expired, or never seen.
    pub fn unknown_proposal_id(proposal_id: &str) -> Self {
        Self::resource_not_found(resource::PROPOSAL, proposal_id)
    }

    /// No pending update with this id: already answered, expired, or never seen.
    pub fn unknown_update_id(update_id: &str) -> Self {
        Self::resource_not_found(resource::UPDATE, update_id)
    }

    pub fn resource_exists(resource_type: &str, resource_id: &str) -> Self {
        Self::new(
            ErrorCode::ResourceExists,
            format!("{} {} already exists", resource_type, resource_id),
            ErrorDetail::ResourceExists {
                resource_type: resource_type.to_string(),
                resource_id: resource_id.to_string(),
            },
        )
    }

    pub fn invalid_argument(name: &str, value: &str, requirement: &str) -> Self {
        Self::new(
            ErrorCode::InvalidArgument,
            format!("invalid value {:?} for {}", value, name),
            ErrorDetail::InvalidArgument {
                name: name.to_string(),
                value: value.to_string(),
                requirement: requirement.to_string(),
            },
        )
    }

    pub fn invalid_payee(payee: &str) -> Self {
        Self::invalid_argument("payee", payee, "must be self or the channel peer")
    }

    pub fn invalid_amount(amount: &str, requirement: &str) -> Self {
        Self::invalid_argument("amount", amount, requirement)
    }

    pub fn failed_pre_condition(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::FailedPreCondition,
            reason.clone(),
            ErrorDetail::FailedPreCondition {
                reason,
                open_channels: Vec::new(),
            },
        )
    }

    /// The session still has channels that are not closed.
    pub fn unclosed_channels(channel_ids: Vec<String>) -> Self {
        let reason = format!("session has {} unclosed channel(s)", channel_ids.len());
        Self::new(
            ErrorCode::FailedPreCondition,
            reason.clone(),
            ErrorDetail::FailedPreCondition {
                reason,
                open_channels: channel_ids,
            },
        )
    }

    pub fn invalid_config(name: &str, value: &str) -> Self {
        Self::new(
            ErrorCode::InvalidConfig,
            format!("invalid configuration for {}", name),
            ErrorDetail::InvalidConfig {
                name: name.to_string(),
                value: value.to_string(),
            },
        )
    }

    pub fn insufficient_balance(available: &str, required: &str) -> Self {
        Self::new(
            ErrorCode::InsufficientBalance,
            format!("insufficient balance: have {}, need {}", available, required),
            ErrorDetail::InsufficientBalance {
                available: available.to_string(),
                required: required.to_string(),
            },
        )
    }

    // -- Protocol fatal -----------------------------------------------------

    pub fn chain_not_reachable(cause: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ChainNotReachable,
            "blockchain node not reachable",
            ErrorDetail::ChainNotReachable {
                cause: cause.into(),
            },
        )
    }

    // -- Internal -----------------------------------------------------------

    pub fn internal(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self::new(
            ErrorCode::UnknownInternal,
            "internal error",
            ErrorDetail::Protocol { cause },
        )
    }

    // -- Classification -----------------------------------------------------

    /// Classify a backend failure that happened while talking to `peer_alias`.
    pub fn from_client(err: ClientError, peer_alias: &str) -> Self {
        let cause = err.to_string();
        match err {
            ClientError::Rejected(reason) => Self::rejected_by_peer(peer_alias, &reason),
            ClientError::ResponseTimeout => Self::new(
                ErrorCode::PeerResponseTimedOut,
                format!("no response from peer {}", peer_alias),
                ErrorDetail::PeerResponseTimedOut {
                    peer_alias: peer_alias.to_string(),
                    timeout_ms: 0,
                },
            ),
            ClientError::Expired => Self::new(
                ErrorCode::UserResponseTimedOut,
                "response was sent after the request expired",
                ErrorDetail::UserResponseTimedOut { cause },
            ),
            ClientError::PeerNotFunded => Self::new(
                ErrorCode::PeerNotFunded,
                format!("peer {} did not fund the channel", peer_alias),
                ErrorDetail::PeerNotFunded {
                    peer_alias: peer_alias.to_string(),
                },
            ),
            ClientError::ChainUnreachable(_) => Self::new(
                ErrorCode::ChainNotReachable,
                "blockchain node not reachable",
                ErrorDetail::ChainNotReachable { cause },
            ),
            ClientError::TxTimeout(_) => Self::new(
                ErrorCode::TxTimedOut,
                "on-chain transaction timed out",
                ErrorDetail::TxTimedOut { cause },
            ),
            ClientError::Disputed(_) => Self::new(
                ErrorCode::ChannelDisputed,
                "channel was disputed on-chain",
                ErrorDetail::Protocol { cause },
            ),
            ClientError::InvalidContracts(_) => Self::new(
                ErrorCode::InvalidContracts,
                "invalid contracts",
                ErrorDetail::InvalidContracts { cause },
            ),
            ClientError::PeerUnreachable(_) => Self::new(
                ErrorCode::OffChainCommFailure,
                format!("cannot communicate with peer {}", peer_alias),
                ErrorDetail::Protocol { cause },
            ),
            ClientError::UnknownChannel(id) => Self::resource_not_found(resource::CHANNEL, &id),
            ClientError::InvalidAddress(_) | ClientError::Wallet(_) | ClientError::Other(_) => {
                Self::internal(cause)
            }
        }
    }

    /// Classify a slot failure. `resource_type` names the stream, `owner` the
    /// session or channel it belongs to.
    pub fn from_subscription(err: SubscriptionError, resource_type: &str, owner: &str) -> Self {
        match err {
            SubscriptionError::AlreadySubscribed => Self::resource_exists(resource_type, owner),
            SubscriptionError::NoActiveSubscription => {
                Self::resource_not_found(resource_type, owner)
            }
            SubscriptionError::QueueFull => Self::internal(err.to_string()),
        }
    }
}

impl From<ContactsError> for APIError {
    fn from(err: ContactsError) -> Self {
        match err {
            ContactsError::ReservedAlias(alias) => {
                Self::invalid_argument("alias", &alias, "alias is reserved")
            }
            ContactsError::AliasTaken(alias) => Self::resource_exists(resource::CONTACT, &alias),
            ContactsError::AddressTaken { address, .. } => {
                Self::resource_exists(resource::CONTACT, &address)
            }
            ContactsError::NotFound(alias) => Self::resource_not_found(resource::CONTACT, &alias),
            ContactsError::Storage { .. } => Self::internal(err.to_string()),
        }
    }
}

impl From<ConfigError> for APIError {
    fn from(err: ConfigError) -> Self {
        match &err {
            ConfigError::InvalidField { field, value, .. } => Self::invalid_config(field, value),
            ConfigError::Unreadable { path, .. } | ConfigError::Malformed { path, .. } => {
                Self::new(
                    ErrorCode::InvalidConfig,
                    err.to_string(),
                    ErrorDetail::InvalidConfig {
                        name: "config_file".to_string(),
                        value: path.clone(),
                    },
                )
            }
        }
    }
}
