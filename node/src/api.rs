//! # REST + WebSocket API
//!
//! The axum router in front of the session core. Every handler resolves the
//! session (and channel) named in the path, calls exactly one core
//! operation, and returns its result as JSON. Core errors are rendered as
//! `{"error": APIError}` with an HTTP status derived from the error code.
//!
//! ## Endpoints
//!
//! | Method | Path                                              | Operation              |
//! |--------|---------------------------------------------------|------------------------|
//! | GET    | `/health`                                         | Liveness probe         |
//! | GET    | `/metrics`                                        | Prometheus metrics     |
//! | GET    | `/sessions`                                       | List sessions          |
//! | POST   | `/sessions`                                       | OpenSession            |
//! | DELETE | `/sessions/:sid?force=`                           | CloseSession           |
//! | POST   | `/sessions/:sid/contacts`                         | AddContact             |
//! | GET    | `/sessions/:sid/contacts/:alias`                  | GetContact             |
//! | GET    | `/sessions/:sid/channels`                         | GetChannels            |
//! | POST   | `/sessions/:sid/channels`                         | OpenChannel            |
//! | GET    | `/sessions/:sid/channels/:cid`                    | Channel info           |
//! | GET    | `/sessions/:sid/channels/:cid/balance`            | GetBalance             |
//! | POST   | `/sessions/:sid/channels/:cid/updates`            | SendUpdate             |
//! | POST   | `/sessions/:sid/channels/:cid/updates/:uid`       | RespondToUpdate        |
//! | POST   | `/sessions/:sid/channels/:cid/close`              | Close                  |
//! | POST   | `/sessions/:sid/proposals/:pid`                   | RespondToProposal      |
//! | GET    | `/sessions/:sid/proposals/ws`                     | Proposal stream        |
//! | GET    | `/sessions/:sid/closes/ws`                        | Close stream           |
//! | GET    | `/sessions/:sid/channels/:cid/updates/ws`         | Update stream          |
//!
//! Calls that reach a peer or the chain accept `?timeout_ms=` as the caller
//! deadline. A WebSocket stream holds the slot's only subscription for as
//! long as the socket is open.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use paynode_protocol::client::AppDescriptor;
use paynode_protocol::contacts::Peer;
use paynode_protocol::notification::{BalanceMap, CloseNotif, ProposalNotif, UpdateNotif};
use paynode_protocol::{
    APIError, CallContext, ChannelInfo, ChannelSession, DeliveryError, ErrorCategory, ErrorCode,
    Node, Session,
};

use crate::metrics::NodeMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state of every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub node: Arc<Node>,
    pub metrics: Arc<NodeMetrics>,
}

impl AppState {
    fn session(&self, session_id: &str) -> Result<Arc<Session>, ApiFailure> {
        Ok(self.node.get_session(session_id)?)
    }

    fn channel(&self, session_id: &str, channel_id: &str) -> Result<Arc<ChannelSession>, ApiFailure> {
        Ok(self.session(session_id)?.get_channel(channel_id)?)
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", get(list_sessions).post(open_session))
        .route("/sessions/:sid", axum::routing::delete(close_session))
        .route("/sessions/:sid/contacts", post(add_contact))
        .route("/sessions/:sid/contacts/:alias", get(get_contact))
        .route("/sessions/:sid/channels", get(get_channels).post(open_channel))
        .route("/sessions/:sid/channels/:cid", get(get_channel))
        .route("/sessions/:sid/channels/:cid/balance", get(get_balance))
        .route("/sessions/:sid/channels/:cid/updates", post(send_update))
        .route("/sessions/:sid/channels/:cid/updates/ws", get(updates_ws))
        .route("/sessions/:sid/channels/:cid/updates/:uid", post(respond_to_update))
        .route("/sessions/:sid/channels/:cid/close", post(close_channel))
        .route("/sessions/:sid/proposals/ws", get(proposals_ws))
        .route("/sessions/:sid/proposals/:pid", post(respond_to_proposal))
        .route("/sessions/:sid/closes/ws", get(closes_ws))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.metrics),
            count_errors,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A core error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiFailure(pub APIError);

impl From<APIError> for ApiFailure {
    fn from(err: APIError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a APIError,
}

/// HTTP status for an error code. The body always carries the exact code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ResourceNotFound => StatusCode::NOT_FOUND,
        ErrorCode::ResourceExists => StatusCode::CONFLICT,
        ErrorCode::InvalidArgument | ErrorCode::InvalidConfig | ErrorCode::InvalidContracts => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::FailedPreCondition | ErrorCode::InsufficientBalance => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorCode::PeerResponseTimedOut | ErrorCode::UserResponseTimedOut | ErrorCode::TxTimedOut => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ErrorCode::RejectedByPeer | ErrorCode::PeerNotFunded | ErrorCode::ChannelDisputed => {
            StatusCode::CONFLICT
        }
        ErrorCode::ChainNotReachable | ErrorCode::OffChainCommFailure => StatusCode::BAD_GATEWAY,
        ErrorCode::UnknownInternal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(err.code());
        if err.category() == ErrorCategory::Internal {
            warn!(error = %err, "internal error returned to caller");
        }
        let mut response = (status, Json(ErrorBody { error: &err })).into_response();
        response.extensions_mut().insert(err.category());
        response
    }
}

/// Counts error responses by category.
async fn count_errors(
    State(metrics): State<Arc<NodeMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if let Some(category) = response.extensions().get::<ErrorCategory>() {
        metrics.record_error(*category);
    }
    response
}

type ApiResult<T> = Result<Json<T>, ApiFailure>;

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// `?timeout_ms=` on calls that reach a peer or the chain.
#[derive(Debug, Default, Deserialize)]
pub struct CallParams {
    pub timeout_ms: Option<u64>,
}

impl CallParams {
    fn context(&self) -> CallContext {
        match self.timeout_ms {
            Some(ms) => CallContext::with_timeout(Duration::from_millis(ms)),
            None => CallContext::background(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    pub config_path: std::path::PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
    pub restored_channels: Vec<ChannelInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user: String,
    pub currency: String,
    pub channels: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct CloseSessionParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    /// Channels that were still open when a forced close went through.
    pub open_channels: Vec<ChannelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct AddContactRequest {
    pub alias: String,
    pub off_chain_address: String,
    pub comm_address: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenChannelRequest {
    pub peer_alias: String,
    pub opening_balances: BalanceMap,
    pub challenge_duration_secs: u64,
    #[serde(default)]
    pub app: Option<AppDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub accept: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RespondToProposalResponse {
    /// The new channel, when the proposal was accepted.
    pub channel: Option<ChannelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SendUpdateRequest {
    pub payee: String,
    pub amount: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "sessions": state.node.session_count(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.metrics.sample(&state.node);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    let mut sessions: Vec<SessionSummary> = state
        .node
        .sessions()
        .iter()
        .map(|s| SessionSummary {
            session_id: s.id().to_string(),
            user: s.user().name.clone(),
            currency: s.currency().to_string(),
            channels: s.get_channels().len(),
        })
        .collect();
    sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Json(sessions)
}

async fn open_session(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionRequest>,
) -> ApiResult<OpenSessionResponse> {
    let (session_id, restored_channels) = state.node.open_session(&req.config_path).await?;
    Ok(Json(OpenSessionResponse {
        session_id,
        restored_channels,
    }))
}

async fn close_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(params): Query<CloseSessionParams>,
) -> ApiResult<CloseSessionResponse> {
    let open_channels = state.node.close_session(&sid, params.force).await?;
    Ok(Json(CloseSessionResponse { open_channels }))
}

async fn add_contact(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(req): Json<AddContactRequest>,
) -> ApiResult<Peer> {
    let peer = state
        .session(&sid)?
        .add_contact(&req.alias, &req.off_chain_address, &req.comm_address)?;
    Ok(Json(peer))
}

async fn get_contact(
    State(state): State<AppState>,
    Path((sid, alias)): Path<(String, String)>,
) -> ApiResult<Peer> {
    Ok(Json(state.session(&sid)?.get_contact(&alias)?))
}

async fn get_channels(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<Vec<ChannelInfo>> {
    let snapshot = state.session(&sid)?.get_channels();
    Ok(Json(snapshot.iter().collect()))
}

async fn open_channel(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(params): Query<CallParams>,
    Json(req): Json<OpenChannelRequest>,
) -> ApiResult<ChannelInfo> {
    let session = state.session(&sid)?;
    let info = session
        .open_channel(
            &params.context(),
            &req.peer_alias,
            &req.opening_balances,
            req.app,
            req.challenge_duration_secs,
        )
        .await?;
    Ok(Json(info))
}

async fn get_channel(
    State(state): State<AppState>,
    Path((sid, cid)): Path<(String, String)>,
) -> ApiResult<ChannelInfo> {
    Ok(Json(state.channel(&sid, &cid)?.info()))
}

async fn get_balance(
    State(state): State<AppState>,
    Path((sid, cid)): Path<(String, String)>,
) -> ApiResult<BalanceMap> {
    Ok(Json(state.channel(&sid, &cid)?.balance()))
}

async fn send_update(
    State(state): State<AppState>,
    Path((sid, cid)): Path<(String, String)>,
    Query(params): Query<CallParams>,
    Json(req): Json<SendUpdateRequest>,
) -> ApiResult<ChannelInfo> {
    let channel = state.channel(&sid, &cid)?;
    let info = channel
        .send_update(&params.context(), &req.payee, &req.amount)
        .await?;
    Ok(Json(info))
}

async fn respond_to_update(
    State(state): State<AppState>,
    Path((sid, cid, uid)): Path<(String, String, String)>,
    Query(params): Query<CallParams>,
    Json(req): Json<RespondRequest>,
) -> ApiResult<ChannelInfo> {
    let channel = state.channel(&sid, &cid)?;
    let info = channel
        .respond_to_update(&params.context(), &uid, req.accept)
        .await?;
    Ok(Json(info))
}

async fn close_channel(
    State(state): State<AppState>,
    Path((sid, cid)): Path<(String, String)>,
    Query(params): Query<CallParams>,
) -> ApiResult<ChannelInfo> {
    let channel = state.channel(&sid, &cid)?;
    Ok(Json(channel.close(&params.context()).await?))
}

async fn respond_to_proposal(
    State(state): State<AppState>,
    Path((sid, pid)): Path<(String, String)>,
    Query(params): Query<CallParams>,
    Json(req): Json<RespondRequest>,
) -> ApiResult<RespondToProposalResponse> {
    let session = state.session(&sid)?;
    let channel = session
        .respond_to_proposal(&params.context(), &pid, req.accept)
        .await?;
    Ok(Json(RespondToProposalResponse { channel }))
}

// ---------------------------------------------------------------------------
// Notification Streams
// ---------------------------------------------------------------------------

fn upgrade_required() -> Response {
    (
        StatusCode::UPGRADE_REQUIRED,
        Json(serde_json::json!({ "error": "websocket upgrade required" })),
    )
        .into_response()
}

/// Notifier that hands notifications to the socket task.
fn forward_to<N: Send + 'static>(
    tx: UnboundedSender<N>,
) -> impl Fn(N) -> Result<(), DeliveryError> + Send + Sync + 'static {
    move |notif| {
        tx.send(notif)
            .map_err(|_| DeliveryError("websocket closed".to_string()))
    }
}

async fn proposals_ws(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiFailure> {
    let session = state.session(&sid)?;
    let Some(ws) = ws else {
        return Ok(upgrade_required());
    };
    let (tx, rx) = unbounded_channel::<ProposalNotif>();
    session.subscribe_proposals(forward_to(tx))?;
    let held = HeldSubscription::new("proposals", move || async move {
        session.unsubscribe_proposals().await
    });

    let metrics = Arc::clone(&state.metrics);
    Ok(ws.on_upgrade(move |socket| pump(socket, rx, metrics, held)))
}

async fn closes_ws(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiFailure> {
    let session = state.session(&sid)?;
    let Some(ws) = ws else {
        return Ok(upgrade_required());
    };
    let (tx, rx) = unbounded_channel::<CloseNotif>();
    session.subscribe_closes(forward_to(tx))?;
    let held = HeldSubscription::new("closes", move || async move {
        session.unsubscribe_closes().await
    });

    let metrics = Arc::clone(&state.metrics);
    Ok(ws.on_upgrade(move |socket| pump(socket, rx, metrics, held)))
}

async fn updates_ws(
    State(state): State<AppState>,
    Path((sid, cid)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiFailure> {
    let channel = state.channel(&sid, &cid)?;
    let Some(ws) = ws else {
        return Ok(upgrade_required());
    };
    let (tx, rx) = unbounded_channel::<UpdateNotif>();
    channel.subscribe_updates(forward_to(tx))?;
    let held = HeldSubscription::new("updates", move || async move {
        channel.unsubscribe_updates().await
    });

    let metrics = Arc::clone(&state.metrics);
    Ok(ws.on_upgrade(move |socket| pump(socket, rx, metrics, held)))
}

type Release = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), APIError>> + Send>;

/// A subscription taken on behalf of a socket. Released on drop unless the
/// pump that owns it saw the core end the stream first, so a handshake that
/// never completes does not leave the slot occupied.
struct HeldSubscription {
    stream: &'static str,
    release: Option<Release>,
}

impl HeldSubscription {
    fn new<U, Fut>(stream: &'static str, unsubscribe: U) -> Self
    where
        U: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), APIError>> + Send + 'static,
    {
        Self {
            stream,
            release: Some(Box::new(move || unsubscribe().boxed())),
        }
    }

    async fn release(mut self) {
        if let Some(release) = self.release.take() {
            if let Err(e) = release().await {
                debug!(stream = self.stream, error = %e, "subscription already released");
            }
        }
    }

    /// The core already ended the subscription; nothing to release.
    fn forget(mut self) {
        self.release = None;
    }
}

impl Drop for HeldSubscription {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let stream = self.stream;
        debug!(stream, "socket never opened, releasing subscription");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = release().await {
                        debug!(stream, error = %e, "subscription already released");
                    }
                });
            }
            Err(_) => warn!(stream, "no runtime to release subscription"),
        }
    }
}

/// Why a socket pump stopped.
#[derive(Debug)]
enum PumpExit {
    /// The client went away; the subscription is still ours to cancel.
    ClientGone,
    /// The core ended the subscription (delivery failure or shutdown).
    StreamEnded,
}

/// Writes notifications to the socket until either side ends, then releases
/// the subscription if it is still held.
async fn pump<N>(
    socket: WebSocket,
    mut rx: UnboundedReceiver<N>,
    metrics: Arc<NodeMetrics>,
    held: HeldSubscription,
) where
    N: Serialize,
{
    let stream = held.stream;
    let (mut sink, mut incoming) = socket.split();

    let exit = loop {
        tokio::select! {
            notif = rx.recv() => {
                let Some(notif) = notif else {
                    break PumpExit::StreamEnded;
                };
                let payload = match serde_json::to_string(&notif) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(stream, error = %e, "failed to serialize notification");
                        continue;
                    }
                };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break PumpExit::ClientGone;
                }
                metrics.record_notification(stream);
            }
            msg = incoming.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break PumpExit::ClientGone,
                    // Push-only; client messages are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    debug!(stream, ?exit, "notification socket finished");
    match exit {
        PumpExit::ClientGone => held.release().await,
        PumpExit::StreamEnded => {
            held.forget();
            let _ = sink.send(Message::Close(None)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use paynode_protocol::config::NodeConfig;
    use paynode_protocol::sim::{SimNetwork, SIM_ADJUDICATOR, SIM_ASSET};
    use std::path::{Path as FsPath, PathBuf};
    use tower::ServiceExt;

    const ALICE_OFF_CHAIN: &str = "0x1111111111111111111111111111111111111111";
    const BOB_OFF_CHAIN: &str = "0x2222222222222222222222222222222222222222";

    struct TestApp {
        router: Router,
        state: AppState,
        _dir: tempfile::TempDir,
        alice_config: PathBuf,
        bob_config: PathBuf,
    }

    fn write_config(dir: &FsPath, name: &str, on_chain: &str, off_chain: &str) -> PathBuf {
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
            "asset": SIM_ASSET
        });
        let path = dir.join(format!("{}.json", name));
        std::fs::write(&path, serde_json::to_vec(&cfg).unwrap()).unwrap();
        path
    }

    fn test_app() -> TestApp {
        let net = SimNetwork::new();
        let node = Node::new(NodeConfig::default(), net.backends()).unwrap();
        let state = AppState {
            version: "0.1.0-test".into(),
            node: Arc::new(node),
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        };
        let dir = tempfile::tempdir().unwrap();
        let alice_config = write_config(
            dir.path(),
            "alice",
            "0xa1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1",
            ALICE_OFF_CHAIN,
        );
        let bob_config = write_config(
            dir.path(),
            "bob",
            "0xb2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2",
            BOB_OFF_CHAIN,
        );
        TestApp {
            router: create_router(state.clone()),
            state,
            _dir: dir,
            alice_config,
            bob_config,
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        send(router, req).await
    }

    async fn get_text(router: &Router, path: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post_json(
        router: &Router,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        send(router, req).await
    }

    async fn delete(router: &Router, path: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("DELETE")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        send(router, req).await
    }

    async fn open(app: &TestApp, config: &FsPath) -> String {
        let (status, body) =
            post_json(&app.router, "/sessions", serde_json::json!({ "config_path": config })).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["session_id"].as_str().unwrap().to_string()
    }

    /// Two sessions that know each other.
    async fn alice_and_bob(app: &TestApp) -> (String, String) {
        let alice = open(app, &app.alice_config).await;
        let bob = open(app, &app.bob_config).await;
        let (status, _) = post_json(
            &app.router,
            &format!("/sessions/{}/contacts", alice),
            serde_json::json!({
                "alias": "bob",
                "off_chain_address": BOB_OFF_CHAIN,
                "comm_address": "bob.local:5751"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post_json(
            &app.router,
            &format!("/sessions/{}/contacts", bob),
            serde_json::json!({
                "alias": "alice",
                "off_chain_address": ALICE_OFF_CHAIN,
                "comm_address": "alice.local:5751"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        (alice, bob)
    }

    /// Bob accepts every proposal through the API.
    fn bob_accepts_via_api(app: &TestApp, bob: &str) {
        let (tx, mut rx) = unbounded_channel::<ProposalNotif>();
        app.state
            .node
            .get_session(bob)
            .unwrap()
            .subscribe_proposals(forward_to(tx))
            .unwrap();
        let router = app.router.clone();
        let bob = bob.to_string();
        tokio::spawn(async move {
            while let Some(notif) = rx.recv().await {
                let path = format!("/sessions/{}/proposals/{}", bob, notif.proposal_id);
                let _ = post_json(&router, &path, serde_json::json!({ "accept": true })).await;
            }
        });
    }

    async fn open_channel_via_api(app: &TestApp, alice: &str) -> serde_json::Value {
        let (status, body) = post_json(
            &app.router,
            &format!("/sessions/{}/channels?timeout_ms=30000", alice),
            serde_json::json!({
                "peer_alias": "bob",
                "opening_balances": { "self": "1", "bob": "2" },
                "challenge_duration_secs": 10
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let app = test_app();
        let (status, body) = get(&app.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn open_session_with_missing_config_is_bad_request() {
        let app = test_app();
        let (status, body) = post_json(
            &app.router,
            "/sessions",
            serde_json::json!({ "config_path": "/nonexistent/session.json" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], 115);
        assert_eq!(body["error"]["category"], "Client");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let app = test_app();
        let (status, body) = get(&app.router, "/sessions/nope/channels").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], 111);
        assert_eq!(body["error"]["detail"]["resource_id"], "nope");
    }

    #[tokio::test]
    async fn sessions_are_listed_and_contacts_resolved() {
        let app = test_app();
        let (alice, _bob) = alice_and_bob(&app).await;

        let (status, body) = get(&app.router, "/sessions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = get(&app.router, &format!("/sessions/{}/contacts/bob", alice)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["off_chain_address"], BOB_OFF_CHAIN);

        let (status, body) = post_json(
            &app.router,
            &format!("/sessions/{}/contacts", alice),
            serde_json::json!({
                "alias": "bob",
                "off_chain_address": "0x3333333333333333333333333333333333333333",
                "comm_address": "x:1"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], 112);
    }

    #[tokio::test]
    async fn channel_lifecycle_over_http() {
        let app = test_app();
        let (alice, bob) = alice_and_bob(&app).await;
        bob_accepts_via_api(&app, &bob);

        let opened = open_channel_via_api(&app, &alice).await;
        let cid = opened["channel_id"].as_str().unwrap().to_string();
        assert_eq!(opened["version"], "0");
        assert_eq!(opened["lock_state"], "open");

        let (status, body) = get(&app.router, &format!("/sessions/{}/channels/{}", bob, cid)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balances"]["self"], "2.000000");
        assert_eq!(body["balances"]["alice"], "1.000000");

        // Bob auto-accepts updates through the core directly.
        let bob_channel = app
            .state
            .node
            .get_session(&bob)
            .unwrap()
            .get_channel(&cid)
            .unwrap();
        let (tx, mut rx) = unbounded_channel::<UpdateNotif>();
        bob_channel.subscribe_updates(forward_to(tx)).unwrap();
        let responder = Arc::clone(&bob_channel);
        tokio::spawn(async move {
            while let Some(notif) = rx.recv().await {
                let _ = responder
                    .respond_to_update(&CallContext::background(), &notif.update_id, true)
                    .await;
            }
        });

        let (status, body) = post_json(
            &app.router,
            &format!("/sessions/{}/channels/{}/updates", alice, cid),
            serde_json::json!({ "payee": "bob", "amount": "0.5" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["balances"]["self"], "0.500000");
        assert_eq!(body["balances"]["bob"], "2.500000");
        assert_eq!(body["version"], "1");

        let (status, body) =
            get(&app.router, &format!("/sessions/{}/channels/{}/balance", bob, cid)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["self"], "2.500000");
        assert_eq!(body["alice"], "0.500000");

        let (status, body) = post_json(
            &app.router,
            &format!("/sessions/{}/channels/{}/close", alice, cid),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["lock_state"], "closed");

        let (status, body) = delete(&app.router, &format!("/sessions/{}", alice)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["open_channels"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_update_is_refused_before_the_network() {
        let app = test_app();
        let (alice, bob) = alice_and_bob(&app).await;
        bob_accepts_via_api(&app, &bob);
        let opened = open_channel_via_api(&app, &alice).await;
        let cid = opened["channel_id"].as_str().unwrap();

        let (status, body) = post_json(
            &app.router,
            &format!("/sessions/{}/channels/{}/updates", alice, cid),
            serde_json::json!({ "payee": "bob", "amount": "12abc" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], 113);

        let (status, body) = post_json(
            &app.router,
            &format!("/sessions/{}/channels/{}/updates", alice, cid),
            serde_json::json!({ "payee": "bob", "amount": "5" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], 117);
    }

    #[tokio::test]
    async fn close_session_with_open_channel_needs_force() {
        let app = test_app();
        let (alice, bob) = alice_and_bob(&app).await;
        bob_accepts_via_api(&app, &bob);
        let opened = open_channel_via_api(&app, &alice).await;

        let (status, body) = delete(&app.router, &format!("/sessions/{}", alice)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], 114);
        assert_eq!(body["error"]["detail"]["open_channels"][0], opened["channel_id"]);

        let (status, body) = delete(&app.router, &format!("/sessions/{}?force=true", alice)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["open_channels"].as_array().unwrap().len(), 1);

        let (status, _) = get(&app.router, &format!("/sessions/{}/channels", alice)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_proposal_id_is_not_found() {
        let app = test_app();
        let (alice, _bob) = alice_and_bob(&app).await;
        let (status, body) = post_json(
            &app.router,
            &format!("/sessions/{}/proposals/deadbeef", alice),
            serde_json::json!({ "accept": true }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], 111);
    }

    #[tokio::test]
    async fn stream_endpoints_need_an_upgrade() {
        let app = test_app();
        let (alice, _bob) = alice_and_bob(&app).await;

        let (status, _) = get(&app.router, &format!("/sessions/{}/proposals/ws", alice)).await;
        assert_eq!(status, StatusCode::UPGRADE_REQUIRED);

        let (status, _) = get(&app.router, "/sessions/missing/closes/ws").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // A refused upgrade must not occupy the slot.
        let session = app.state.node.get_session(&alice).unwrap();
        let (tx, _rx) = unbounded_channel::<ProposalNotif>();
        assert!(session.subscribe_proposals(forward_to(tx)).is_ok());
    }

    #[tokio::test]
    async fn errors_are_counted_by_category() {
        let app = test_app();
        let _ = get(&app.router, "/sessions/nope/channels").await;
        let _ = get(&app.router, "/sessions/nope/channels").await;

        let (status, text) = get_text(&app.router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("paynode_api_errors_total{category=\"client\"} 2"));
        assert!(text.contains("paynode_sessions_open 0"));
    }

    #[test]
    fn every_code_has_a_status() {
        for code in ErrorCode::ALL {
            let status = status_for(code);
            assert!(status.is_client_error() || status.is_server_error());
        }
    }

    #[tokio::test]
    async fn abandoned_handshake_frees_the_stream() {
        let app = test_app();
        let alice = open(&app, &app.alice_config).await;
        let session = app.state.node.get_session(&alice).unwrap();

        let (tx, rx) = unbounded_channel::<ProposalNotif>();
        session.subscribe_proposals(forward_to(tx)).unwrap();
        let held = {
            let session = Arc::clone(&session);
            HeldSubscription::new("proposals", move || async move {
                session.unsubscribe_proposals().await
            })
        };
        // What on_upgrade drops when the handshake fails.
        drop((rx, held));

        let mut freed = false;
        for _ in 0..100 {
            let (tx, _rx) = unbounded_channel::<ProposalNotif>();
            if session.subscribe_proposals(forward_to(tx)).is_ok() {
                freed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(freed, "proposal stream still held after the handshake was dropped");
    }

    #[tokio::test]
    async fn stream_ended_by_the_core_is_not_released_twice() {
        let app = test_app();
        let alice = open(&app, &app.alice_config).await;
        let session = app.state.node.get_session(&alice).unwrap();

        let (tx, _rx) = unbounded_channel::<CloseNotif>();
        session.subscribe_closes(forward_to(tx)).unwrap();
        let held = {
            let session = Arc::clone(&session);
            HeldSubscription::new("closes", move || async move {
                session.unsubscribe_closes().await
            })
        };
        session.unsubscribe_closes().await.unwrap();
        let (tx, _rx2) = unbounded_channel::<CloseNotif>();
        session.subscribe_closes(forward_to(tx)).unwrap();

        held.forget();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let err = session
            .subscribe_closes(|_n: CloseNotif| -> Result<(), DeliveryError> { Ok(()) })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExists);
    }

    #[tokio::test]
    async fn forwarder_reports_a_closed_socket() {
        let (tx, rx) = unbounded_channel::<u32>();
        let notify = forward_to(tx);
        assert!(notify(1).is_ok());
        drop(rx);
        assert!(notify(2).is_err());
    }
}
