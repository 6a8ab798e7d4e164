//! Controller (§4.1): the top-level state machine. Owns the DB Gateway,
//! the Auth Module's credentials, one Peer Client (one upstream `server`
//! is configured per process — see `config::ReplicationConfig`), and, in
//! master mode, the LISTEN subscription and Work Queue.
//!
//! The event loop is a single cooperative `tokio::select!` over a 1s
//! timer, the LISTEN connection, and the peer socket — no worker tasks,
//! matching the single-threaded model this component is specified under.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use replctl_protocol::Message;
use sqlx::postgres::PgListener;
use tracing::{error, info, warn};

use crate::auth::{self, AuthError, ProviderCredentials};
use crate::config::{ControllerConfig, Mode};
use crate::db::{ChangeNotification, DbGateway};
use crate::peer_client::{ConnectOutcome, PeerClient, PeerClientConfig, PeerClientError, PeerClientEvent};
use crate::work_queue::WorkQueue;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);
const FIXED_INTERVAL: Duration = Duration::from_secs(30);
const APPLY_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const AUTH_RENEW_MARGIN: Duration = Duration::from_secs(55 * 60);
const CONNECT_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Authorization,
    Authorized,
    InProgress,
    Running,
}

/// Events that drive the §4.1 status state machine, kept separate from the
/// I/O that triggers them so the table itself can be tested without a
/// database or peer connection (see `transition` below).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    HeartbeatTick,
    AuthSuccess,
    AuthFailure,
    FixedDateElapsed,
    PeerInstantiated,
    FatalError,
    PeerDisconnectedWithSession,
    PeerDisconnectedNoSession,
}

/// Pure rendering of §4.1's status state machine table. Events that don't
/// apply to the current status are no-ops, matching the table's silence on
/// every other `(status, event)` pair.
fn transition(from: Status, event: StatusEvent) -> Status {
    match (from, event) {
        (_, StatusEvent::HeartbeatTick) => Status::Authorization,
        (Status::Authorization, StatusEvent::AuthSuccess) => Status::Authorized,
        (Status::Authorization, StatusEvent::AuthFailure) => Status::Stopped,
        (Status::Authorized, StatusEvent::FixedDateElapsed) => Status::InProgress,
        (Status::InProgress, StatusEvent::PeerInstantiated) => Status::Running,
        (_, StatusEvent::FatalError) => Status::Stopped,
        (Status::Running, StatusEvent::PeerDisconnectedWithSession) => Status::Authorized,
        (Status::Running, StatusEvent::PeerDisconnectedNoSession) => Status::Authorization,
        (other, _) => other,
    }
}

pub struct Controller {
    mode: Mode,
    source: String,
    origin_host: String,
    status: Status,

    session: Option<String>,
    secret: Option<String>,
    credentials: ProviderCredentials,

    /// Highest relay log id observed from the peer during the current pull
    /// cycle (§3), updated by the CheckReplicationRelay callback effect.
    relay_id: Option<i64>,
    apply_count: i64,
    error_count: u64,
    apply_primed: bool,
    /// Set by the master-side check-RPC result (CheckReplicationRelay);
    /// consulted by heartbeat step 3 to decide whether to re-check the
    /// local relay high-water mark.
    need_check_replication_log: bool,

    check_date: Instant,
    fixed_date: Instant,
    apply_date: Instant,

    db: DbGateway,
    listen_channel: String,
    listener: Option<PgListener>,

    http: reqwest::Client,
    peer: PeerClient,
    work_queue: Option<WorkQueue>,

    exiting: Arc<AtomicBool>,
    tick_interval: Duration,
}

impl Controller {
    pub fn new(config: &ControllerConfig, credentials: ProviderCredentials, db: DbGateway) -> Self {
        let now = Instant::now();
        let origin_host = host_of(&config.replication.server);
        let peer = PeerClient::new(
            PeerClientConfig {
                uri: config.replication.server.clone(),
                source: config.replication.source.clone(),
                heartbeat_interval: Duration::from_secs(600),
            },
            String::new(),
            String::new(),
        );
        let work_queue = config
            .replication
            .mode
            .is_publisher()
            .then(|| WorkQueue::new(config.database.pool_min));

        Controller {
            mode: config.replication.mode,
            source: config.replication.source.clone(),
            origin_host,
            status: Status::Stopped,
            session: None,
            secret: None,
            credentials,
            relay_id: None,
            apply_count: 0,
            error_count: 0,
            apply_primed: false,
            need_check_replication_log: false,
            check_date: now,
            fixed_date: now,
            apply_date: now,
            db,
            listen_channel: config.database.listen_channel.clone(),
            listener: None,
            http: reqwest::Client::new(),
            peer,
            work_queue,
            exiting: Arc::new(AtomicBool::new(false)),
            tick_interval: Duration::from_millis(config.heartbeat.tick_ms),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// §3 Lifecycles: reload clears all mutable state except process
    /// identity (`mode`, `source`), re-arming the state machine from
    /// `Stopped`.
    pub fn reload(&mut self, config: &ControllerConfig, credentials: ProviderCredentials) {
        let now = Instant::now();
        self.status = Status::Stopped;
        self.session = None;
        self.secret = None;
        self.credentials = credentials;
        self.relay_id = None;
        self.apply_count = 0;
        self.error_count = 0;
        self.apply_primed = false;
        self.need_check_replication_log = false;
        self.check_date = now;
        self.fixed_date = now;
        self.apply_date = now;
        self.listener = None;
        self.peer.reload();
        self.peer = PeerClient::new(
            PeerClientConfig {
                uri: config.replication.server.clone(),
                source: config.replication.source.clone(),
                heartbeat_interval: Duration::from_secs(600),
            },
            String::new(),
            String::new(),
        );
        self.listen_channel = config.database.listen_channel.clone();
        self.work_queue = config
            .replication
            .mode
            .is_publisher()
            .then(|| WorkQueue::new(config.database.pool_min));
    }

    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exiting)
    }

    pub fn quit(&self) {
        self.exiting.store(true, Ordering::Relaxed);
    }

    fn should_exit(&self) -> bool {
        self.exiting.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.heartbeat(Instant::now()).await;
                }
                notification = recv_notification(&mut self.listener), if self.listener.is_some() => {
                    match notification {
                        Ok(n) => self.handle_notification(n),
                        Err(e) => self.on_database_error(e),
                    }
                }
                frame = self.peer.recv(Instant::now()), if self.peer.is_connected() => {
                    match frame {
                        Ok(Some(msg)) => self.handle_peer_message(msg).await,
                        Ok(None) => {}
                        Err(e) => self.on_websocket_error(e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    self.quit();
                }
            }

            if self.should_exit() {
                info!("controller exiting");
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Heartbeat (§4.1)
    // -----------------------------------------------------------------------

    async fn heartbeat(&mut self, now: Instant) {
        // Step 1
        if now >= self.check_date {
            self.check_date = now + CHECK_INTERVAL;
            self.status = transition(self.status, StatusEvent::HeartbeatTick);
            self.try_authorize().await;
            if self.mode.is_publisher() && self.listener.is_none() {
                match self.db.listen(&self.listen_channel).await {
                    Ok(listener) => self.listener = Some(listener),
                    Err(e) => self.on_database_error(e),
                }
            }
        }

        // Step 2
        if self.status == Status::Authorized && now >= self.fixed_date {
            self.fixed_date = now + FIXED_INTERVAL;
            self.status = transition(self.status, StatusEvent::FixedDateElapsed);
            self.ensure_peer_connected().await;
            if let Err(e) = self.peer.send_replication_apply().await {
                self.on_websocket_error(e);
            }
            self.status = transition(self.status, StatusEvent::PeerInstantiated);
        }

        // Step 3: §3's `get_max_relay_id` is the DB Gateway RPC (§4.4), not
        // the WS `/replication/relay/max` call already driven by the peer
        // client's own catch-up cadence (`peer_client.rs::tick`). Re-run it
        // whenever the last pull cycle produced nothing to apply, or when
        // the CheckReplicationRelay callback flagged fresh relay activity.
        if self.status == Status::Running && now >= self.fixed_date {
            self.fixed_date = now + FIXED_INTERVAL;
            if !self.peer.is_connected() {
                self.ensure_peer_connected().await;
            } else if self.apply_count == 0 || self.need_check_replication_log {
                match self.db.get_max_relay_id(&self.source).await {
                    Ok(id) => {
                        self.relay_id = id;
                        self.need_check_replication_log = false;
                    }
                    Err(e) => self.on_database_error(e),
                }
            }
        }

        // Step 4
        if self.status == Status::Running && self.apply_count >= 0 && now >= self.apply_date {
            if !self.apply_primed {
                self.apply_date = now;
                self.apply_primed = true;
            } else {
                self.apply_date = now + APPLY_SWEEP_INTERVAL;
                if let Err(e) = self.peer.send_replication_apply().await {
                    self.on_websocket_error(e);
                }
            }
        }

        // Step 5: peer client's own heartbeat (ping/pong/authorize/catch-up).
        match self.peer.tick(now).await {
            Ok(true) => self.fixed_date = now,
            Ok(false) => {}
            Err(e) => self.on_websocket_error(e),
        }
        if self.peer.heartbeat_due(now) {
            self.peer.reset_heartbeat(now);
            info!(
                send_count = self.peer.send_count(),
                in_flight = self.peer.in_flight_len(),
                "peer client heartbeat"
            );
        }

        // Step 5 (master): drain the work queue.
        if self.mode.is_publisher() {
            self.drain_work_queue().await;
        }
    }

    async fn try_authorize(&mut self) {
        match auth::exchange_for_session(&self.http, &self.credentials).await {
            Ok(result) => {
                self.session = Some(result.session.clone());
                self.secret = Some(result.secret.clone());
                self.peer.set_credentials(result.session, result.secret);
                self.status = transition(self.status, StatusEvent::AuthSuccess);
                self.check_date = Instant::now() + AUTH_RENEW_MARGIN;
            }
            Err(e) => self.on_auth_error(e),
        }
    }

    async fn ensure_peer_connected(&mut self) {
        if self.peer.is_connected() {
            return;
        }
        loop {
            match self.peer.connect().await {
                Ok(ConnectOutcome::Connected) => return,
                Ok(ConnectOutcome::Redirected) => continue,
                Err(e) => {
                    warn!(error = %e, "peer connect failed, backing off 1 minute");
                    self.fixed_date = Instant::now() + CONNECT_BACKOFF;
                    return;
                }
            }
        }
    }

    fn handle_notification(&mut self, notification: ChangeNotification) {
        if self.status != Status::Running {
            return;
        }
        if notification.source == self.origin_host {
            return;
        }
        if let Some(queue) = self.work_queue.as_mut() {
            queue.enqueue(notification.id);
        }
    }

    async fn drain_work_queue(&mut self) {
        loop {
            let Some(queue) = self.work_queue.as_mut() else {
                return;
            };
            let Some(replication_id) = queue.next_fireable() else {
                return;
            };

            let row = match self.db.get_replication_log(replication_id).await {
                Ok(row) => row,
                Err(e) => {
                    self.on_database_error(e);
                    self.work_queue.as_mut().expect("checked above").complete();
                    continue;
                }
            };

            // This path only runs in Master mode (gated by `mode.is_publisher()`
            // in `heartbeat`), so `marks_proxied_rows()` (Proxy-only) would
            // always read false here. `examples/original_source/Replication.cpp`
            // resolves the outbound `proxy` flag as true exactly when the local
            // mode is Master (`pClient->Proxy(m_Mode == rmMaster)`).
            let proxy = self.mode == Mode::Master;
            if let Err(e) = self.peer.send_relay_add(replication_id, row, proxy).await {
                warn!(replication_id, error = %e, "relay add failed, row buffered for replay");
            }
            self.work_queue.as_mut().expect("checked above").complete();
        }
    }

    async fn handle_peer_message(&mut self, msg: Message) {
        match self.peer.dispatch(msg) {
            PeerClientEvent::AuthorizeResult { authorized: true } => {
                if let Err(e) = self.peer.send_subscribe().await {
                    self.on_websocket_error(e);
                }
            }
            PeerClientEvent::AuthorizeResult { authorized: false } => {
                self.on_fatal_session_error("peer rejected Authorize".to_owned());
            }
            PeerClientEvent::SubscribeOk => {
                if let Err(e) = self.peer.send_get_max_relay().await {
                    self.on_websocket_error(e);
                }
            }
            PeerClientEvent::MaxRelay { id } => {
                // CheckReplicationRelay callback (§4.2): record the peer's
                // high-water relay id and flag the next heartbeat to
                // re-check it, then flush anything buffered while not yet
                // authorized/connected.
                if let Some(relay_id) = id {
                    self.relay_id = Some(relay_id);
                    self.need_check_replication_log = true;
                    if let Err(e) = self.peer.flush_pending().await {
                        self.on_websocket_error(e);
                    }
                }
            }
            PeerClientEvent::ApplyResult { count } => {
                self.apply_count = (self.apply_count - count).max(0);
            }
            PeerClientEvent::MaxLog { id: Some(relay_id) } => {
                if let Err(e) = self.peer.send_replication_log(relay_id).await {
                    self.on_websocket_error(e);
                }
            }
            PeerClientEvent::MaxLog { id: None } => {}
            PeerClientEvent::ReplicationLogRows { payload } => {
                self.apply_incoming_rows(payload).await;
            }
            PeerClientEvent::RelayAddOk | PeerClientEvent::RelayAddUnauthorized { .. } => {}
            PeerClientEvent::Pong | PeerClientEvent::Unhandled => {}
        }
    }

    async fn apply_incoming_rows(&mut self, payload: serde_json::Value) {
        let rows: Vec<serde_json::Value> = match payload {
            serde_json::Value::Array(rows) => rows,
            serde_json::Value::Null => Vec::new(),
            other => vec![other],
        };

        let mut inserted_count = 0u32;
        let mut last_relay_id = None;

        for row in rows {
            let (action, schema, name, key, data, id, datetime) = match extract_row_fields(&row) {
                Some(fields) => fields,
                None => {
                    warn!("skipping malformed replication log row");
                    continue;
                }
            };

            match self
                .db
                .add_to_relay_log(
                    &self.source, id, datetime, &action, &schema, &name, &key, &data,
                    self.mode.marks_proxied_rows(),
                )
                .await
            {
                Ok(relay_id) => {
                    self.apply_count += 1;
                    inserted_count += 1;
                    last_relay_id = Some(relay_id);
                }
                Err(e) => self.on_database_error(e),
            }
        }

        // Mirrors `examples/original_source/Replication.cpp`'s
        // `if (count == 1) ApplyRelay(...) else Apply()`: a single new row
        // is applied directly by id; any other count (including zero) runs
        // the bulk sweep instead.
        if inserted_count == 1 {
            if let Some(relay_id) = last_relay_id {
                match self.db.replication_apply_relay(&self.source, relay_id).await {
                    Ok(applied) => self.apply_count = (self.apply_count - applied).max(0),
                    Err(e) => self.on_database_error(e),
                }
            }
        } else if self.apply_count > 0 {
            match self.db.replication_apply(&self.source).await {
                Ok(applied) => self.apply_count = (self.apply_count - applied).max(0),
                Err(e) => self.on_database_error(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Error classes (§7)
    // -----------------------------------------------------------------------

    fn on_database_error(&mut self, err: sqlx::Error) {
        self.error_count = self.error_count.saturating_add(1);
        error!(error = %err, "transient database error");
    }

    fn on_auth_error(&mut self, err: AuthError) {
        self.error_count = self.error_count.saturating_add(1);
        error!(error = %err, "authorization failed");
        self.status = transition(self.status, StatusEvent::AuthFailure);
        self.session = None;
        self.secret = None;
    }

    fn on_fatal_session_error(&mut self, reason: String) {
        self.error_count = self.error_count.saturating_add(1);
        error!(reason = %reason, "fatal session error");
        self.session = None;
        self.secret = None;
        let now = Instant::now();
        self.fixed_date = now;
        self.apply_date = now;
        self.apply_primed = false;
        self.status = transition(self.status, StatusEvent::FatalError);
    }

    fn on_websocket_error(&mut self, err: PeerClientError) {
        self.error_count = self.error_count.saturating_add(1);
        warn!(error = %err, "peer client error");
        match self.status {
            Status::Running if self.session.is_some() => {
                self.status = transition(self.status, StatusEvent::PeerDisconnectedWithSession);
            }
            Status::Running => {
                self.status = transition(self.status, StatusEvent::PeerDisconnectedNoSession);
            }
            _ => {}
        }
    }
}

async fn recv_notification(
    listener: &mut Option<PgListener>,
) -> Result<ChangeNotification, sqlx::Error> {
    let listener = listener.as_mut().expect("guarded by is_some() in select!");
    let raw = listener.recv().await?;
    DbGateway::parse_notification(&raw)
}

fn host_of(uri: &str) -> String {
    uri.split("://")
        .nth(1)
        .unwrap_or(uri)
        .split(['/', ':'])
        .next()
        .unwrap_or("")
        .to_owned()
}

fn extract_row_fields(
    row: &serde_json::Value,
) -> Option<(
    String,
    String,
    String,
    serde_json::Value,
    serde_json::Value,
    i64,
    chrono::DateTime<chrono::Utc>,
)> {
    let id = row.get("id")?.as_i64()?;
    let action = row.get("action")?.as_str()?.to_owned();
    let schema = row.get("schema")?.as_str()?.to_owned();
    let name = row.get("table").or_else(|| row.get("name"))?.as_str()?.to_owned();
    let key = row.get("key")?.clone();
    let data = row.get("data")?.clone();
    let datetime = row
        .get("datetime")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);
    Some((action, schema, name, key, data, id, datetime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_extracts_host_from_wss_uri() {
        assert_eq!(host_of("wss://peer.example.com/ws/replication"), "peer.example.com");
    }

    #[test]
    fn host_of_strips_port() {
        assert_eq!(host_of("wss://peer.example.com:8443/ws"), "peer.example.com");
    }

    #[test]
    fn extract_row_fields_requires_core_columns() {
        let row = serde_json::json!({"id": 1, "action": "insert"});
        assert!(extract_row_fields(&row).is_none());
    }

    #[test]
    fn transition_drives_the_happy_path_through_all_five_statuses() {
        let mut status = Status::Stopped;
        status = transition(status, StatusEvent::HeartbeatTick);
        assert_eq!(status, Status::Authorization);
        status = transition(status, StatusEvent::AuthSuccess);
        assert_eq!(status, Status::Authorized);
        status = transition(status, StatusEvent::FixedDateElapsed);
        assert_eq!(status, Status::InProgress);
        status = transition(status, StatusEvent::PeerInstantiated);
        assert_eq!(status, Status::Running);
    }

    #[test]
    fn transition_auth_failure_returns_to_stopped() {
        assert_eq!(
            transition(Status::Authorization, StatusEvent::AuthFailure),
            Status::Stopped
        );
    }

    #[test]
    fn transition_fatal_error_stops_from_any_status() {
        for status in [
            Status::Stopped,
            Status::Authorization,
            Status::Authorized,
            Status::InProgress,
            Status::Running,
        ] {
            assert_eq!(transition(status, StatusEvent::FatalError), Status::Stopped);
        }
    }

    #[test]
    fn transition_peer_disconnect_with_session_falls_back_to_authorized() {
        assert_eq!(
            transition(Status::Running, StatusEvent::PeerDisconnectedWithSession),
            Status::Authorized
        );
    }

    #[test]
    fn transition_peer_disconnect_without_session_falls_back_to_authorization() {
        assert_eq!(
            transition(Status::Running, StatusEvent::PeerDisconnectedNoSession),
            Status::Authorization
        );
    }

    #[test]
    fn transition_ignores_events_that_do_not_apply_to_the_current_status() {
        // AuthSuccess only fires out of Authorization; elsewhere it's a no-op.
        assert_eq!(transition(Status::Stopped, StatusEvent::AuthSuccess), Status::Stopped);
        assert_eq!(transition(Status::Running, StatusEvent::AuthSuccess), Status::Running);
        // FixedDateElapsed only fires out of Authorized.
        assert_eq!(
            transition(Status::InProgress, StatusEvent::FixedDateElapsed),
            Status::InProgress
        );
    }

    #[test]
    fn extract_row_fields_parses_a_complete_row() {
        let row = serde_json::json!({
            "id": 7,
            "action": "update",
            "schema": "public",
            "table": "orders",
            "key": {"id": 7},
            "data": {"status": "shipped"},
            "datetime": "2026-01-01T00:00:00Z",
        });
        let (action, schema, name, _key, _data, id, _dt) = extract_row_fields(&row).unwrap();
        assert_eq!(action, "update");
        assert_eq!(schema, "public");
        assert_eq!(name, "orders");
        assert_eq!(id, 7);
    }
}
