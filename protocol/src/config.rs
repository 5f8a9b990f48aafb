//! # Node & Session Configuration
//!
//! Every default and every tunable in paynode lives here. Two configuration
//! documents exist:
//!
//! - [`NodeConfig`]: process-wide settings (listen port, default timeouts,
//!   supported currencies). Loaded once by the binary.
//! - [`SessionConfig`]: one per user session, passed by path to
//!   `OpenSession`. Names the user, the chain contracts, the contacts file
//!   and optional per-session timeout overrides.
//!
//! Both are JSON documents. Validation failures are reported as
//! [`ConfigError`], which the session layer turns into `Client/InvalidConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timeout::TimeoutConfig;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Alias every session uses to refer to its own user. Contacts can never
/// claim it.
pub const SELF_ALIAS: &str = "self";

/// Currency used when a session config does not name one.
pub const DEFAULT_CURRENCY: &str = "ETH";

/// How long a peer gets to answer an off-chain request.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an on-chain transaction gets to be mined.
pub const DEFAULT_ON_CHAIN_TX_TIMEOUT: Duration = Duration::from_secs(60);

/// Slack added to every computed deadline for local processing.
pub const DEFAULT_PROCESSING_MARGIN: Duration = Duration::from_secs(1);

/// How long the node waits for the chain backend while opening a session.
pub const DEFAULT_CHAIN_CONN_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the queue between an event source and a delivery task.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 64;

/// Notifications held for a slot that has no subscriber yet. Oldest are
/// evicted first once this fills up.
pub const PENDING_NOTIFICATION_CACHE: usize = 32;

/// Default HTTP/WS API port of the `paynode` binary.
pub const DEFAULT_API_PORT: u16 = 50001;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A configuration document could not be read or is semantically invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {reason}")]
    Unreadable {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error text.
        reason: String,
    },

    /// The file is not valid JSON for the expected schema.
    #[error("cannot parse config file {path}: {reason}")]
    Malformed {
        /// Path that was attempted.
        path: String,
        /// Underlying parser error text.
        reason: String,
    },

    /// A field holds a value that cannot be used.
    #[error("invalid value {value:?} for field {field}: {reason}")]
    InvalidField {
        /// Dotted field name, e.g. `user.on_chain_address`.
        field: String,
        /// The offending value, rendered as a string.
        value: String,
        /// Why it was refused.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, value: impl Into<String>, reason: &str) -> Self {
        ConfigError::InvalidField {
            field: field.to_string(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    /// Name of the field (or file) the error is about.
    pub fn field(&self) -> &str {
        match self {
            ConfigError::Unreadable { path, .. } | ConfigError::Malformed { path, .. } => path,
            ConfigError::InvalidField { field, .. } => field,
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Malformed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Node Configuration
// ---------------------------------------------------------------------------

/// Process-wide configuration for a paynode instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port of the HTTP/WebSocket API.
    pub api_port: u16,
    /// Default peer response timeout, in seconds.
    pub response_timeout_secs: u64,
    /// Default on-chain transaction timeout, in seconds.
    pub on_chain_tx_timeout_secs: u64,
    /// Processing margin added to every deadline, in milliseconds.
    pub processing_margin_ms: u64,
    /// Currencies sessions may use.
    pub currencies: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            api_port: DEFAULT_API_PORT,
            response_timeout_secs: DEFAULT_RESPONSE_TIMEOUT.as_secs(),
            on_chain_tx_timeout_secs: DEFAULT_ON_CHAIN_TX_TIMEOUT.as_secs(),
            processing_margin_ms: DEFAULT_PROCESSING_MARGIN.as_millis() as u64,
            currencies: vec![DEFAULT_CURRENCY.to_string()],
        }
    }
}

impl NodeConfig {
    /// Load a node config from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg: NodeConfig = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "response_timeout_secs",
                "0",
                "must be positive",
            ));
        }
        if self.on_chain_tx_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "on_chain_tx_timeout_secs",
                "0",
                "must be positive",
            ));
        }
        if self.currencies.is_empty() {
            return Err(ConfigError::invalid(
                "currencies",
                "[]",
                "at least one currency is required",
            ));
        }
        Ok(())
    }

    /// Timeout parameters every session inherits unless it overrides them.
    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig {
            response: Duration::from_secs(self.response_timeout_secs),
            on_chain_tx: Duration::from_secs(self.on_chain_tx_timeout_secs),
            processing_margin: Duration::from_millis(self.processing_margin_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Session Configuration
// ---------------------------------------------------------------------------

/// The user a session acts for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfig {
    /// Display name; the session itself always refers to the user as `self`.
    #[serde(default)]
    pub name: String,
    /// Address holding on-chain funds.
    pub on_chain_address: String,
    /// Address used to sign off-chain states and to be reached by peers.
    pub off_chain_address: String,
    /// Transport endpoint of the user (e.g. `127.0.0.1:5751`).
    pub comm_address: String,
    /// Keystore directory for the wallet backend.
    pub keystore_path: PathBuf,
    /// Password unlocking both accounts.
    #[serde(default)]
    pub password: String,
}

/// A session configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// The user this session belongs to.
    pub user: UserConfig,
    /// Blockchain node endpoint.
    pub chain_url: String,
    /// Adjudicator contract address.
    pub adjudicator: String,
    /// Asset holder contract address.
    pub asset: String,
    /// Currency of every channel opened in this session.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// JSON contacts file. Created on first write when missing.
    pub contacts_path: Option<PathBuf>,
    /// Restore channels from the protocol client's persistence on open.
    #[serde(default)]
    pub persistence_enabled: bool,
    /// Override of the node's response timeout, in seconds.
    pub response_timeout_secs: Option<u64>,
    /// Override of the node's on-chain transaction timeout, in seconds.
    pub on_chain_tx_timeout_secs: Option<u64>,
    /// Chain connection timeout, in seconds.
    pub chain_conn_timeout_secs: Option<u64>,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

impl SessionConfig {
    /// Load and structurally validate a session config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg: SessionConfig = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural checks that do not need a backend. Address syntax is
    /// checked later by the wallet backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("user.on_chain_address", &self.user.on_chain_address),
            ("user.off_chain_address", &self.user.off_chain_address),
            ("user.comm_address", &self.user.comm_address),
            ("chain_url", &self.chain_url),
            ("adjudicator", &self.adjudicator),
            ("asset", &self.asset),
            ("currency", &self.currency),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(field, value.as_str(), "must not be empty"));
            }
        }
        for (field, value) in [
            ("response_timeout_secs", self.response_timeout_secs),
            ("on_chain_tx_timeout_secs", self.on_chain_tx_timeout_secs),
            ("chain_conn_timeout_secs", self.chain_conn_timeout_secs),
        ] {
            if value == Some(0) {
                return Err(ConfigError::invalid(field, "0", "must be positive"));
            }
        }
        Ok(())
    }

    /// Effective timeouts: per-session overrides on top of the node defaults.
    pub fn timeouts(&self, node_defaults: &TimeoutConfig) -> TimeoutConfig {
        TimeoutConfig {
            response: self
                .response_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(node_defaults.response),
            on_chain_tx: self
                .on_chain_tx_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(node_defaults.on_chain_tx),
            processing_margin: node_defaults.processing_margin,
        }
    }

    /// Effective chain connection timeout.
    pub fn chain_conn_timeout(&self) -> Duration {
        self.chain_conn_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CHAIN_CONN_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_session_json() -> serde_json::Value {
        serde_json::json!({
            "user": {
                "name": "alice",
                "on_chain_address": "0x1111111111111111111111111111111111111111",
                "off_chain_address": "0x2222222222222222222222222222222222222222",
                "comm_address": "127.0.0.1:5751",
                "keystore_path": "/tmp/keystore",
                "password": ""
            },
            "chain_url": "ws://127.0.0.1:8545",
            "adjudicator": "0x3333333333333333333333333333333333333333",
            "asset": "0x4444444444444444444444444444444444444444",
            "contacts_path": null
        })
    }

    #[test]
    fn node_config_defaults_are_valid() {
        let cfg = NodeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.currencies, vec!["ETH".to_string()]);
        assert_eq!(cfg.timeouts().response, DEFAULT_RESPONSE_TIMEOUT);
    }

    #[test]
    fn node_config_rejects_zero_timeout() {
        let cfg = NodeConfig {
            response_timeout_secs: 0,
            ..NodeConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field(), "response_timeout_secs");
    }

    #[test]
    fn session_config_loads_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", sample_session_json()).unwrap();

        let cfg = SessionConfig::load(file.path()).unwrap();
        assert_eq!(cfg.currency, "ETH");
        assert!(!cfg.persistence_enabled);
        assert_eq!(cfg.chain_conn_timeout(), DEFAULT_CHAIN_CONN_TIMEOUT);
    }

    #[test]
    fn session_config_reports_empty_field() {
        let mut json = sample_session_json();
        json["adjudicator"] = serde_json::json!("  ");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json).unwrap();

        let err = SessionConfig::load(file.path()).unwrap_err();
        assert_eq!(err.field(), "adjudicator");
    }

    #[test]
    fn session_config_missing_file_is_unreadable() {
        let err = SessionConfig::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[test]
    fn session_overrides_take_precedence() {
        let mut cfg: SessionConfig = serde_json::from_value(sample_session_json()).unwrap();
        cfg.response_timeout_secs = Some(3);
        let node = NodeConfig::default().timeouts();

        let effective = cfg.timeouts(&node);
        assert_eq!(effective.response, Duration::from_secs(3));
        assert_eq!(effective.on_chain_tx, node.on_chain_tx);
    }
}
