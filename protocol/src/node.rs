//! # Node Registry
//!
//! Owns every open session of a paynode process. Opening a session validates
//! its configuration against the backends (address syntax, keystore, chain
//! contracts) before any protocol client is created, so a session that exists
//! in the registry is always usable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::channel::ChannelInfo;
use crate::client::{Address, Backends, UserIdentity};
use crate::config::{ConfigError, NodeConfig, SessionConfig};
use crate::contacts::{ContactStore, JsonContacts};
use crate::currency::Currencies;
use crate::error::{resource, APIError};
use crate::session::{Session, SessionParts};
use crate::timeout::TimeoutConfig;

/// Registry of open sessions.
pub struct Node {
    config: NodeConfig,
    timeouts: TimeoutConfig,
    backends: Backends,
    currencies: Currencies,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Node {
    pub fn new(config: NodeConfig, backends: Backends) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut currencies = Currencies::builtin();
        let unknown = currencies.restrict_to(&config.currencies);
        if !unknown.is_empty() {
            return Err(ConfigError::invalid(
                "currencies",
                unknown.join(","),
                "unsupported currency",
            ));
        }
        Ok(Self {
            timeouts: config.timeouts(),
            config,
            backends,
            currencies,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Every open session, in no particular order.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn get_session(&self, session_id: &str) -> Result<Arc<Session>, APIError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| APIError::resource_not_found(resource::SESSION, session_id))
    }

    /// Open a session from the config file at `config_path`. Returns the new
    /// session id and, when persistence is enabled, the restored channels.
    pub async fn open_session(
        &self,
        config_path: &Path,
    ) -> Result<(String, Vec<ChannelInfo>), APIError> {
        let cfg = SessionConfig::load(config_path)?;
        let currency = self
            .currencies
            .get(&cfg.currency)
            .ok_or_else(|| APIError::invalid_config("currency", &cfg.currency))?;

        let wallet = &self.backends.wallet;
        let parse = |field: &str, raw: &str| -> Result<Address, APIError> {
            wallet
                .parse_address(raw)
                .map_err(|_| APIError::invalid_config(field, raw))
        };
        let on_chain = parse("user.on_chain_address", &cfg.user.on_chain_address)?;
        let off_chain = parse("user.off_chain_address", &cfg.user.off_chain_address)?;
        let adjudicator = parse("adjudicator", &cfg.adjudicator)?;
        let asset = parse("asset", &cfg.asset)?;

        for account in [&on_chain, &off_chain] {
            wallet
                .unlock(&cfg.user.keystore_path, account, &cfg.user.password)
                .map_err(|_| {
                    APIError::invalid_config(
                        "user.keystore_path",
                        &cfg.user.keystore_path.display().to_string(),
                    )
                })?;
        }

        let chain_check = self
            .backends
            .chain
            .validate_contracts(&cfg.chain_url, &adjudicator, &asset);
        match tokio::time::timeout(cfg.chain_conn_timeout(), chain_check).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(APIError::from_client(e, &cfg.chain_url)),
            Err(_) => {
                return Err(APIError::chain_not_reachable(format!(
                    "no answer from {} within {:?}",
                    cfg.chain_url,
                    cfg.chain_conn_timeout()
                )))
            }
        }

        let contacts: Arc<dyn ContactStore> = match &cfg.contacts_path {
            Some(path) => Arc::new(JsonContacts::open(path).map_err(|_| {
                APIError::invalid_config("contacts_path", &path.display().to_string())
            })?),
            None => Arc::new(JsonContacts::in_memory()),
        };
        for peer in contacts.all() {
            if wallet.parse_address(peer.off_chain_address.as_str()).is_err() {
                return Err(APIError::invalid_config(
                    "contacts_path",
                    peer.off_chain_address.as_str(),
                ));
            }
        }

        let user = UserIdentity {
            name: cfg.user.name.clone(),
            on_chain,
            off_chain,
            comm_address: cfg.user.comm_address.clone(),
        };
        let client = self
            .backends
            .clients
            .connect(&user, &cfg)
            .await
            .map_err(|e| APIError::from_client(e, &user.comm_address))?;

        let session = Session::new(SessionParts {
            id: uuid::Uuid::new_v4().to_string(),
            user,
            client: Arc::clone(&client),
            contacts,
            wallet: Arc::clone(wallet),
            currency,
            timeouts: cfg.timeouts(&self.timeouts),
        });

        let mut restored = Vec::new();
        if cfg.persistence_enabled {
            let handles = match client.restore_channels().await {
                Ok(handles) => handles,
                Err(e) => {
                    let _ = session.close(true).await;
                    return Err(APIError::from_client(e, session.id()));
                }
            };
            for handle in handles {
                restored.push(session.restore_channel(handle)?.info());
            }
        }

        let id = session.id().to_string();
        self.sessions.write().insert(id.clone(), session);
        info!(session = %id, config = %config_path.display(), restored = restored.len(), "session opened");
        Ok((id, restored))
    }

    /// Close a session and release it. See [`Session::close`].
    pub async fn close_session(
        &self,
        session_id: &str,
        force: bool,
    ) -> Result<Vec<ChannelInfo>, APIError> {
        let session = self.get_session(session_id)?;
        let still_open = session.close(force).await?;
        self.sessions.write().remove(session_id);
        Ok(still_open)
    }

    /// Force-close every session. Used on process shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = session.close(true).await {
                warn!(session = %session.id(), error = %e, "session did not close cleanly");
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("sessions", &self.session_count())
            .field("currencies", &self.currencies)
            .finish()
    }
}
