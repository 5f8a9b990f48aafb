//! Shared fixtures: a node on a sim network with two sessions that know each
//! other as contacts.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;

use paynode_protocol::config::NodeConfig;
use paynode_protocol::notification::{BalanceMap, CloseNotif, ProposalNotif, UpdateNotif};
use paynode_protocol::sim::{SimNetwork, SIM_ADJUDICATOR, SIM_ASSET};
use paynode_protocol::subscription::DeliveryError;
use paynode_protocol::{CallContext, ChannelInfo, ChannelSession, Node, Session};

pub const ALICE_ON_CHAIN: &str = "0xa1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1";
pub const ALICE_OFF_CHAIN: &str = "0x1111111111111111111111111111111111111111";
pub const BOB_ON_CHAIN: &str = "0xb2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2";
pub const BOB_OFF_CHAIN: &str = "0x2222222222222222222222222222222222222222";

pub struct Harness {
    pub net: SimNetwork,
    pub node: Node,
    pub dir: tempfile::TempDir,
    pub alice: Arc<Session>,
    pub bob: Arc<Session>,
    pub alice_config: PathBuf,
    pub bob_config: PathBuf,
}

pub fn write_session_config(
    dir: &Path,
    name: &str,
    on_chain: &str,
    off_chain: &str,
    persistence: bool,
) -> PathBuf {
    let cfg = serde_json::json!({
        "user": {
            "name": name,
            "on_chain_address": on_chain,
            "off_chain_address": off_chain,
            "comm_address": format!("{}.local:5751", name),
            "keystore_path": dir.join("keystore"),
            "password": ""
        },
        "chain_url": "ws://sim.local:8545",
        "adjudicator": SIM_ADJUDICATOR,
        "asset": SIM_ASSET,
        "contacts_path": dir.join(format!("{}-contacts.json", name)),
        "persistence_enabled": persistence
    });
    let path = dir.join(format!("{}-session.json", name));
    std::fs::write(&path, serde_json::to_vec_pretty(&cfg).unwrap()).unwrap();
    path
}

pub async fn setup() -> Harness {
    setup_with(false).await
}

pub async fn setup_with(persistence: bool) -> Harness {
    let net = SimNetwork::new();
    let node = Node::new(NodeConfig::default(), net.backends()).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let alice_config =
        write_session_config(dir.path(), "alice", ALICE_ON_CHAIN, ALICE_OFF_CHAIN, persistence);
    let bob_config =
        write_session_config(dir.path(), "bob", BOB_ON_CHAIN, BOB_OFF_CHAIN, persistence);

    let (alice_id, _) = node.open_session(&alice_config).await.unwrap();
    let (bob_id, _) = node.open_session(&bob_config).await.unwrap();
    let alice = node.get_session(&alice_id).unwrap();
    let bob = node.get_session(&bob_id).unwrap();

    alice
        .add_contact("bob", BOB_OFF_CHAIN, "bob.local:5751")
        .unwrap();
    bob.add_contact("alice", ALICE_OFF_CHAIN, "alice.local:5751")
        .unwrap();

    Harness {
        net,
        node,
        dir,
        alice,
        bob,
        alice_config,
        bob_config,
    }
}

pub fn balances(pairs: &[(&str, &str)]) -> BalanceMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Receive with a generous bound so a broken test fails instead of hanging.
pub async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification stream closed")
}

pub fn subscribe_proposals(session: &Session) -> UnboundedReceiver<ProposalNotif> {
    let (tx, rx) = unbounded_channel();
    session
        .subscribe_proposals(move |n: ProposalNotif| tx.send(n).map_err(|e| DeliveryError(e.to_string())))
        .unwrap();
    rx
}

pub fn subscribe_closes(session: &Session) -> UnboundedReceiver<CloseNotif> {
    let (tx, rx) = unbounded_channel();
    session
        .subscribe_closes(move |n: CloseNotif| tx.send(n).map_err(|e| DeliveryError(e.to_string())))
        .unwrap();
    rx
}

pub fn subscribe_updates(channel: &ChannelSession) -> UnboundedReceiver<UpdateNotif> {
    let (tx, rx) = unbounded_channel();
    channel
        .subscribe_updates(move |n: UpdateNotif| tx.send(n).map_err(|e| DeliveryError(e.to_string())))
        .unwrap();
    rx
}

/// Answer every incoming proposal on `session` with `accept`.
pub fn auto_respond_proposals(session: Arc<Session>, accept: bool) -> JoinHandle<()> {
    let mut rx = subscribe_proposals(&session);
    tokio::spawn(async move {
        while let Some(notif) = rx.recv().await {
            let _ = session
                .respond_to_proposal(&CallContext::background(), &notif.proposal_id, accept)
                .await;
        }
    })
}

/// Answer every incoming update on `channel` with `accept`.
pub fn auto_respond_updates(channel: Arc<ChannelSession>, accept: bool) -> JoinHandle<()> {
    let mut rx = subscribe_updates(&channel);
    tokio::spawn(async move {
        while let Some(notif) = rx.recv().await {
            let _ = channel
                .respond_to_update(&CallContext::background(), &notif.update_id, accept)
                .await;
        }
    })
}

/// Alice opens `{self: 1, bob: 2}` ETH with bob accepting. Returns alice's
/// view and bob's channel.
pub async fn open_alice_bob_channel(h: &Harness) -> (ChannelInfo, Arc<ChannelSession>) {
    let responder = auto_respond_proposals(Arc::clone(&h.bob), true);
    let info = h
        .alice
        .open_channel(
            &CallContext::background(),
            "bob",
            &balances(&[("self", "1"), ("bob", "2")]),
            None,
            10,
        )
        .await
        .unwrap();
    h.bob.unsubscribe_proposals().await.unwrap();
    responder.await.unwrap();
    let bob_channel = h.bob.get_channel(&info.channel_id).unwrap();
    (info, bob_channel)
}
