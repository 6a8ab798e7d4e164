//! Peer Client (§4.2): one instance per configured upstream peer. Owns a
//! single upgradeable WebSocket connection, the request/response
//! correlation map, and the catch-up state machine.
//!
//! Adapted from the teacher's `UplinkSession` (outbound `tokio-tungstenite`
//! client with a bearer-auth upgrade request); generalized from a single
//! hello/ack exchange to the full Open/Call/CallResult/CallError protocol
//! of §6, and from one fixed RPC sequence to the five correlated RPCs of
//! §4.2.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use replctl_protocol::{actions, error_codes, Message, UniqueId};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tracing::{debug, info, warn};

const PONG_TIMEOUT: Duration = Duration::from_secs(90);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const REGISTRATION_INTERVAL: Duration = Duration::from_secs(30);
const CATCHUP_INTERVAL_AFTER_SUCCESS: Duration = Duration::from_secs(60 * 60);
const MAX_IN_FLIGHT: usize = 256;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// What an outstanding `Call` was for, so its `CallResult`/`CallError` can
/// be routed back to the right next step without a closure graph.
#[derive(Debug, Clone)]
pub enum PendingCall {
    Authorize,
    Subscribe,
    GetMaxRelay,
    ReplicationApply,
    GetMaxLog,
    RelayAdd { replication_id: i64, original: Message },
    ReplicationLog,
}

/// The semantic outcome of dispatching one inbound frame, for the
/// Controller/driving loop to act on.
#[derive(Debug, Clone)]
pub enum PeerClientEvent {
    AuthorizeResult { authorized: bool },
    SubscribeOk,
    MaxRelay { id: Option<i64> },
    ApplyResult { count: i64 },
    MaxLog { id: Option<i64> },
    RelayAddOk,
    RelayAddUnauthorized { original: Message },
    ReplicationLogRows { payload: Value },
    Pong,
    /// A frame that did not correlate to any outstanding call (late
    /// response, or a Notify we don't act on yet); logged and dropped.
    Unhandled,
}

/// Configuration needed to open a Peer Client connection.
#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    pub uri: String,
    pub source: String,
    pub heartbeat_interval: Duration,
}

pub struct PeerClient {
    cfg: PeerClientConfig,
    ws: Option<WsStream>,
    session: String,
    secret: String,
    authorized: bool,
    send_count: u32,
    in_flight: HashMap<UniqueId, PendingCall>,
    pending_data: Vec<(i64, Value)>,
    pending_messages: Vec<Message>,
    ping_ts: Instant,
    pong_ts: Instant,
    heartbeat_ts: Instant,
    registration_ts: Instant,
    apply_ts: Instant,
}

impl PeerClient {
    pub fn new(cfg: PeerClientConfig, session: String, secret: String) -> Self {
        let now = Instant::now();
        PeerClient {
            cfg,
            ws: None,
            session,
            secret,
            authorized: false,
            send_count: 0,
            in_flight: HashMap::new(),
            pending_data: Vec::new(),
            pending_messages: Vec::new(),
            ping_ts: now,
            pong_ts: now,
            heartbeat_ts: now,
            registration_ts: now,
            apply_ts: now, // immediate on first connect, per §4.2 step 4
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ws.is_some()
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn uri(&self) -> &str {
        &self.cfg.uri
    }

    /// Installs the session/secret pair obtained from a fresh auth
    /// exchange. Does not otherwise touch connection state.
    pub fn set_credentials(&mut self, session: String, secret: String) {
        self.session = session;
        self.secret = secret;
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    // -------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------

    /// Perform the TCP connect + HTTP upgrade handshake. On HTTP 301/302,
    /// follows the redirect by updating `cfg.uri` and returning
    /// `ConnectOutcome::Redirected` so the caller retries immediately
    /// without backing off.
    pub async fn connect(&mut self) -> Result<ConnectOutcome, PeerClientError> {
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::Error as WsError;

        let request = self
            .cfg
            .uri
            .clone()
            .into_client_request()
            .map_err(|e| PeerClientError::Connect(format!("invalid URI '{}': {}", self.cfg.uri, e)))?;

        match connect_async(request).await {
            Ok((ws, _response)) => {
                self.ws = Some(ws);
                Ok(ConnectOutcome::Connected)
            }
            Err(WsError::Http(response)) if is_redirect(response.status().as_u16()) => {
                if let Some(location) = response
                    .headers()
                    .get("Location")
                    .and_then(|v| v.to_str().ok())
                {
                    info!(from = %self.cfg.uri, to = %location, "peer client following redirect");
                    self.cfg.uri = location.to_owned();
                    Ok(ConnectOutcome::Redirected)
                } else {
                    Err(PeerClientError::Connect(
                        "redirect response missing Location header".to_owned(),
                    ))
                }
            }
            Err(e) => Err(PeerClientError::Connect(e.to_string())),
        }
    }

    /// §4.2 "Reload": clears transport-bound state but preserves
    /// credentials so the next connect attempt can re-authorize.
    pub fn reload(&mut self) {
        self.ws = None;
        self.authorized = false;
        self.send_count = 0;
        let now = Instant::now();
        self.pong_ts = now;
        self.heartbeat_ts = now;
        self.registration_ts = now;
    }

    // -------------------------------------------------------------------
    // Heartbeat (§4.2)
    // -------------------------------------------------------------------

    /// Run one 1-second heartbeat tick. Returns `true` if a `TimeOut`
    /// occurred (no pong for ≥ 90s) — the caller must close the
    /// connection and tell the Controller to reset `fixedDate`.
    pub async fn tick(&mut self, now: Instant) -> Result<bool, PeerClientError> {
        if now.duration_since(self.pong_ts) >= PONG_TIMEOUT {
            self.close().await;
            return Ok(true);
        }

        if self.ws.is_none() {
            return Ok(false);
        }

        if now >= self.ping_ts {
            self.ping_ts = now + PING_INTERVAL;
            self.send_ping().await?;
        } else if !self.authorized && now >= self.registration_ts {
            self.registration_ts = now + REGISTRATION_INTERVAL;
            self.send_authorize().await?;
        } else if now >= self.apply_ts {
            self.apply_ts = now + CATCHUP_INTERVAL_AFTER_SUCCESS;
            self.send_replication_apply().await?;
            self.send_get_max_log().await?;
            self.send_get_max_relay().await?;
        }

        Ok(false)
    }

    /// Whether the configurable controller-notify heartbeat is due.
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now >= self.heartbeat_ts
    }

    pub fn reset_heartbeat(&mut self, now: Instant) {
        self.heartbeat_ts = now + self.cfg.heartbeat_interval;
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
    }

    // -------------------------------------------------------------------
    // RPCs (§4.2)
    // -------------------------------------------------------------------

    pub async fn send_authorize(&mut self) -> Result<UniqueId, PeerClientError> {
        let msg = Message::open(actions::AUTHORIZE, json!({ "secret": self.secret }));
        self.register(msg.unique_id().clone(), PendingCall::Authorize);
        self.send(msg).await
    }

    pub async fn send_subscribe(&mut self) -> Result<UniqueId, PeerClientError> {
        let payload = json!({
            "publisher": "replication",
            "params": { "source": self.cfg.source },
        });
        let msg = Message::call(actions::SUBSCRIBE, payload);
        self.register(msg.unique_id().clone(), PendingCall::Subscribe);
        self.send(msg).await
    }

    pub async fn send_get_max_relay(&mut self) -> Result<UniqueId, PeerClientError> {
        let msg = Message::call(
            actions::REPLICATION_RELAY_MAX,
            json!({ "source": self.cfg.source }),
        );
        self.register(msg.unique_id().clone(), PendingCall::GetMaxRelay);
        self.send(msg).await
    }

    pub async fn send_replication_apply(&mut self) -> Result<UniqueId, PeerClientError> {
        let msg = Message::call(
            actions::REPLICATION_APPLY,
            json!({ "source": self.cfg.source }),
        );
        self.register(msg.unique_id().clone(), PendingCall::ReplicationApply);
        self.send(msg).await
    }

    pub async fn send_get_max_log(&mut self) -> Result<UniqueId, PeerClientError> {
        let msg = Message::call(actions::REPLICATION_LOG_MAX, Value::Null);
        self.register(msg.unique_id().clone(), PendingCall::GetMaxLog);
        self.send(msg).await
    }

    /// `/replication/log` — pulls up to one row past `relay_id` for the
    /// slave-side apply path.
    pub async fn send_replication_log(&mut self, relay_id: i64) -> Result<UniqueId, PeerClientError> {
        let payload = json!({
            "id": relay_id,
            "source": self.cfg.source,
            "reclimit": 1,
        });
        let msg = Message::call(actions::REPLICATION_LOG, payload);
        self.register(msg.unique_id().clone(), PendingCall::ReplicationLog);
        self.send(msg).await
    }

    /// `/replication/relay/add` — forward one changed row to this peer.
    /// `row` is augmented with `source` (local) and `proxy`.
    pub async fn send_relay_add(
        &mut self,
        replication_id: i64,
        mut row: Value,
        proxy: bool,
    ) -> Result<UniqueId, PeerClientError> {
        if let Value::Object(ref mut map) = row {
            map.insert("source".to_owned(), Value::String(self.cfg.source.clone()));
            map.insert("proxy".to_owned(), Value::Bool(proxy));
        }

        if !self.is_ready() {
            self.pending_data.push((replication_id, row));
            return Err(PeerClientError::NotReady);
        }

        let msg = Message::call(actions::REPLICATION_RELAY_ADD, row);
        self.send_count += 1;
        self.register(
            msg.unique_id().clone(),
            PendingCall::RelayAdd {
                replication_id,
                original: msg.clone(),
            },
        );
        self.send(msg).await
    }

    fn is_ready(&self) -> bool {
        self.ws.is_some() && self.authorized
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Flush buffered rows and replayed messages once `GetMaxRelay`
    /// succeeds (§4.2 step "/replication/relay/max").
    pub async fn flush_pending(&mut self) -> Result<(), PeerClientError> {
        let rows: Vec<(i64, Value)> = self.pending_data.drain(..).collect();
        for (replication_id, row) in rows {
            let msg = Message::call(actions::REPLICATION_RELAY_ADD, row);
            self.send_count += 1;
            self.register(
                msg.unique_id().clone(),
                PendingCall::RelayAdd {
                    replication_id,
                    original: msg.clone(),
                },
            );
            self.send(msg).await?;
        }

        let replays: Vec<Message> = self.pending_messages.drain(..).collect();
        for msg in replays {
            self.send(msg).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Frame send/recv
    // -------------------------------------------------------------------

    fn register(&mut self, uid: UniqueId, call: PendingCall) {
        if self.in_flight.len() >= MAX_IN_FLIGHT {
            warn!(
                in_flight = self.in_flight.len(),
                "peer client inFlight at capacity, dropping oldest correlation is not possible; new call may time out"
            );
        }
        self.in_flight.insert(uid, call);
    }

    async fn send(&mut self, msg: Message) -> Result<UniqueId, PeerClientError> {
        let ws = self.ws.as_mut().ok_or(PeerClientError::NotReady)?;
        let json = msg
            .to_json()
            .map_err(|e| PeerClientError::Serialization(e.to_string()))?;
        ws.send(WsFrame::Text(json.into()))
            .await
            .map_err(|e| PeerClientError::Ws(e.to_string()))?;
        Ok(msg.unique_id().clone())
    }

    async fn send_ping(&mut self) -> Result<(), PeerClientError> {
        let ws = self.ws.as_mut().ok_or(PeerClientError::NotReady)?;
        ws.send(WsFrame::Ping(Vec::new().into()))
            .await
            .map_err(|e| PeerClientError::Ws(e.to_string()))
    }

    /// Receive and decode the next frame. Replies to pings transparently
    /// and records pongs against the timeout cursor; callers should loop
    /// until a frame worth dispatching is returned.
    pub async fn recv(&mut self, now: Instant) -> Result<Option<Message>, PeerClientError> {
        let ws = match self.ws.as_mut() {
            Some(ws) => ws,
            None => return Err(PeerClientError::Disconnected),
        };

        match ws.next().await {
            None => {
                self.ws = None;
                Err(PeerClientError::Disconnected)
            }
            Some(Err(e)) => {
                self.ws = None;
                Err(PeerClientError::Ws(e.to_string()))
            }
            Some(Ok(WsFrame::Text(t))) => {
                let msg = Message::from_json(&t)
                    .map_err(|e| PeerClientError::Protocol(format!("JSON parse: {e}")))?;
                Ok(Some(msg))
            }
            Some(Ok(WsFrame::Pong(_))) => {
                self.pong_ts = now;
                Ok(None)
            }
            Some(Ok(WsFrame::Ping(data))) => {
                if let Some(ws) = self.ws.as_mut() {
                    let _ = ws.send(WsFrame::Pong(data)).await;
                }
                Ok(None)
            }
            Some(Ok(WsFrame::Close(_))) => {
                self.ws = None;
                Err(PeerClientError::Disconnected)
            }
            Some(Ok(_)) => Ok(None),
        }
    }

    /// Correlate an inbound frame against `in_flight` and produce the
    /// typed event the driving loop should act on.
    pub fn dispatch(&mut self, msg: Message) -> PeerClientEvent {
        match msg {
            Message::CallResult { unique_id, payload } => {
                match self.in_flight.remove(&unique_id) {
                    Some(PendingCall::Authorize) => {
                        let authorized = payload.get("authorized").and_then(Value::as_bool).unwrap_or(false);
                        self.authorized = authorized;
                        PeerClientEvent::AuthorizeResult { authorized }
                    }
                    Some(PendingCall::Subscribe) => PeerClientEvent::SubscribeOk,
                    Some(PendingCall::GetMaxRelay) => PeerClientEvent::MaxRelay {
                        id: payload.get("id").and_then(Value::as_i64),
                    },
                    Some(PendingCall::ReplicationApply) => {
                        let count = payload.get("count").and_then(Value::as_i64).unwrap_or(0);
                        if count > 0 {
                            self.apply_ts = Instant::now();
                        }
                        PeerClientEvent::ApplyResult { count }
                    }
                    Some(PendingCall::GetMaxLog) => PeerClientEvent::MaxLog {
                        id: payload.get("id").and_then(Value::as_i64),
                    },
                    Some(PendingCall::RelayAdd { .. }) => {
                        self.send_count = self.send_count.saturating_sub(1);
                        PeerClientEvent::RelayAddOk
                    }
                    Some(PendingCall::ReplicationLog) => {
                        PeerClientEvent::ReplicationLogRows { payload }
                    }
                    None => {
                        debug!(unique_id = %unique_id, "CallResult for unknown uniqueId");
                        PeerClientEvent::Unhandled
                    }
                }
            }
            Message::CallError {
                unique_id,
                error_code,
                error_message,
                ..
            } => {
                match self.in_flight.remove(&unique_id) {
                    Some(PendingCall::RelayAdd { original, .. }) if error_code == error_codes::UNAUTHORIZED => {
                        self.send_count = self.send_count.saturating_sub(1);
                        self.authorized = false;
                        self.registration_ts = Instant::now();
                        self.pending_messages.push(original.clone());
                        PeerClientEvent::RelayAddUnauthorized { original }
                    }
                    Some(_) | None => {
                        warn!(
                            unique_id = %unique_id,
                            code = error_code,
                            message = %error_message,
                            "CallError on peer client; exchange abandoned"
                        );
                        PeerClientEvent::Unhandled
                    }
                }
            }
            Message::Open { action, payload, .. } if action == actions::SUBSCRIBE => {
                // Peer-initiated Open is not part of this controller's role;
                // treated as unrecognized per §6 (404 Not Supported).
                let _ = payload;
                PeerClientEvent::Unhandled
            }
            _ => PeerClientEvent::Unhandled,
        }
    }
}

pub enum ConnectOutcome {
    Connected,
    Redirected,
}

fn is_redirect(status: u16) -> bool {
    status == 301 || status == 302
}

#[derive(Debug, Error)]
pub enum PeerClientError {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    Ws(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("peer client not ready (disconnected or unauthorized)")]
    NotReady,
    #[error("websocket disconnected")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PeerClient {
        PeerClient::new(
            PeerClientConfig {
                uri: "wss://peer.example.com/ws/replication".to_owned(),
                source: "node-a".to_owned(),
                heartbeat_interval: Duration::from_secs(600),
            },
            "S1".to_owned(),
            "K1".to_owned(),
        )
    }

    #[test]
    fn new_client_starts_unauthorized_and_disconnected() {
        let c = client();
        assert!(!c.is_authorized());
        assert!(!c.is_connected());
        assert_eq!(c.send_count(), 0);
    }

    #[test]
    fn dispatch_authorize_result_sets_authorized_flag() {
        let mut c = client();
        let uid = UniqueId::generate();
        c.in_flight.insert(uid.clone(), PendingCall::Authorize);
        let event = c.dispatch(Message::CallResult {
            unique_id: uid,
            payload: json!({"authorized": true}),
        });
        assert!(matches!(event, PeerClientEvent::AuthorizeResult { authorized: true }));
        assert!(c.is_authorized());
    }

    #[test]
    fn dispatch_unauthorized_relay_add_requeues_message() {
        let mut c = client();
        let uid = UniqueId::generate();
        let original = Message::call(actions::REPLICATION_RELAY_ADD, json!({"id": 7}));
        c.in_flight.insert(
            uid.clone(),
            PendingCall::RelayAdd {
                replication_id: 7,
                original: original.clone(),
            },
        );
        c.send_count = 1;
        c.authorized = true;

        let event = c.dispatch(Message::CallError {
            unique_id: uid,
            error_code: error_codes::UNAUTHORIZED,
            error_message: "expired".to_owned(),
            payload: Value::Null,
        });

        assert!(matches!(event, PeerClientEvent::RelayAddUnauthorized { .. }));
        assert!(!c.is_authorized());
        assert_eq!(c.send_count(), 0);
        assert_eq!(c.pending_messages.len(), 1);
    }

    #[test]
    fn dispatch_get_max_relay_reports_null_id() {
        let mut c = client();
        let uid = UniqueId::generate();
        c.in_flight.insert(uid.clone(), PendingCall::GetMaxRelay);
        let event = c.dispatch(Message::CallResult {
            unique_id: uid,
            payload: Value::Null,
        });
        assert!(matches!(event, PeerClientEvent::MaxRelay { id: None }));
    }

    #[test]
    fn unknown_unique_id_is_unhandled_not_a_panic() {
        let mut c = client();
        let event = c.dispatch(Message::CallResult {
            unique_id: UniqueId::generate(),
            payload: Value::Null,
        });
        assert!(matches!(event, PeerClientEvent::Unhandled));
    }
}
