//! WebSocket Game Server
//!
//! Async WebSocket gateway. Authenticates each connection at handshake,
//! decodes client messages, applies them through the session cache and
//! fans resulting state out through the room broadcaster.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::core::id::{GameId, UserId};
use crate::game::deck::{MAX_PAIRS, MIN_PAIRS};
use crate::game::rules::{flip, resolve_match};
use crate::network::auth::{AuthError, TokenVerifier};
use crate::network::protocol::{
    ClientMessage, CreateRequest, FlipRequest, JoinRequest, MatchRequest, ProtocolError,
    ServerMessage, CLOSE_INVALID_CREDENTIAL, CLOSE_MISSING_CREDENTIAL, REASON_INVALID_CREDENTIAL,
    REASON_MISSING_CREDENTIAL, REASON_SHUTDOWN,
};
use crate::network::room::{
    ConnectionHandle, ConnectionId, Outbound, RoomBroadcaster, CLOSE_GOING_AWAY, OUTBOUND_BUFFER,
};
use crate::network::session::{CacheConfig, Committed, SessionCache, SessionError};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Where game records are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// In-process only; lost on restart.
    Memory,
    /// One JSON file per game under this directory.
    Dir(PathBuf),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Session cache settings.
    pub cache: CacheConfig,
    /// Durable store location.
    pub store: StoreLocation,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            cache: CacheConfig::default(),
            store: StoreLocation::Dir(PathBuf::from("./data/games")),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Value could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// Value parsed but is outside the accepted range.
    #[error("{var} out of range: {reason}")]
    OutOfRange {
        /// Variable name.
        var: &'static str,
        /// What was wrong.
        reason: String,
    },
}

impl ServerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through `lookup`, defaulting anything unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = parse_var::<SocketAddr>(&lookup, "BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(port) = parse_var::<u16>(&lookup, "PORT")? {
            config.bind_addr.set_port(port);
        }
        if let Some(max) = parse_var::<usize>(&lookup, "MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CACHE_IDLE_TTL_SECS")? {
            config.cache.idle_ttl = nonzero_secs("CACHE_IDLE_TTL_SECS", secs)?;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CACHE_SWEEP_INTERVAL_SECS")? {
            config.cache.sweep_interval = nonzero_secs("CACHE_SWEEP_INTERVAL_SECS", secs)?;
        }
        if let Some(pairs) = parse_var::<usize>(&lookup, "DEFAULT_PAIRS")? {
            if !(MIN_PAIRS..=MAX_PAIRS).contains(&pairs) {
                return Err(ConfigError::OutOfRange {
                    var: "DEFAULT_PAIRS",
                    reason: format!("{} not in {}..={}", pairs, MIN_PAIRS, MAX_PAIRS),
                });
            }
            config.cache.default_pairs = pairs;
        }
        if let Some(dir) = lookup("STORE_DIR").filter(|d| !d.trim().is_empty()) {
            config.store = if dir == ":memory:" {
                StoreLocation::Memory
            } else {
                StoreLocation::Dir(PathBuf::from(dir))
            };
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(None),
    }
}

fn nonzero_secs(var: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::OutOfRange { var, reason: "must be at least 1".into() });
    }
    Ok(Duration::from_secs(secs))
}

// =============================================================================
// ERRORS
// =============================================================================

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Bearer credential from the upgrade request.
///
/// `Authorization: Bearer <token>` wins over a `token` query parameter,
/// which is percent-decoded.
pub fn extract_credential(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    request
        .uri()
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| decode_query_value(value))
        .filter(|t| !t.is_empty())
}

/// Percent-decode a query value. Undecodable input is kept as sent and
/// left for the verifier to reject.
fn decode_query_value(value: &str) -> String {
    match urlencoding::decode(value) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => value.to_string(),
    }
}

/// Close code and reason for a rejected handshake.
pub fn rejection_close(err: &AuthError) -> (u16, &'static str) {
    match err {
        AuthError::MissingCredential => (CLOSE_MISSING_CREDENTIAL, REASON_MISSING_CREDENTIAL),
        _ => (CLOSE_INVALID_CREDENTIAL, REASON_INVALID_CREDENTIAL),
    }
}

async fn close_with(ws: &mut WebSocketStream<TcpStream>, code: u16, reason: &'static str) {
    let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "close handshake failed");
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Connected client state.
struct ConnectedClient {
    user_id: UserId,
    addr: SocketAddr,
    connected_at: Instant,
}

/// State shared by every connection task.
struct ServerContext {
    cache: Arc<SessionCache>,
    rooms: Arc<RoomBroadcaster>,
    verifier: Arc<dyn TokenVerifier>,
    clients: RwLock<BTreeMap<ConnectionId, ConnectedClient>>,
    /// Fired after the drain; every connection closes with 1001.
    closed_tx: broadcast::Sender<()>,
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    next_conn_id: AtomicU64,
    /// One permit per accepted socket, held until its task ends.
    connection_limit: Arc<Semaphore>,
    shutting_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(
        config: ServerConfig,
        cache: Arc<SessionCache>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (closed_tx, _) = broadcast::channel(1);
        let connection_limit =
            Arc::new(Semaphore::new(config.max_connections.min(Semaphore::MAX_PERMITS)));

        Self {
            config,
            ctx: Arc::new(ServerContext {
                cache,
                rooms: Arc::new(RoomBroadcaster::new()),
                verifier,
                clients: RwLock::new(BTreeMap::new()),
                closed_tx,
            }),
            next_conn_id: AtomicU64::new(1),
            connection_limit,
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Session cache.
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.ctx.cache
    }

    /// Room broadcaster.
    pub fn rooms(&self) -> &Arc<RoomBroadcaster> {
        &self.ctx.rooms
    }

    /// Bind `config.bind_addr` and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on `listener` until [`GameServer::shutdown`], then drain.
    ///
    /// Drain order: stop accepting, flush every cached game, close every
    /// connection, release the listener.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, version = %self.config.version, "game server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sweeper = tokio::spawn(
            self.ctx
                .cache
                .clone()
                .run_eviction_loop(self.config.cache.sweep_interval, self.shutdown_tx.subscribe()),
        );

        while !self.shutting_down.load(Ordering::SeqCst) {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let limit = self.connection_limit.clone();
                            let Ok(permit) = limit.try_acquire_owned() else {
                                warn!(%addr, "connection limit reached, rejecting");
                                continue;
                            };
                            self.handle_connection(stream, addr, permit);
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        sweeper.abort();
        let _ = sweeper.await;

        let report = self.ctx.cache.drain().await;
        let closed = self.ctx.rooms.close_all().await;
        let _ = self.ctx.closed_tx.send(());
        drop(listener);

        info!(
            flushed = report.flushed,
            failed = report.failed,
            closed_connections = closed,
            "game server stopped"
        );
        Ok(())
    }

    /// Handle a new TCP connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let conn_id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let ctx = self.ctx.clone();
        // Subscribed at accept so a drain during the handshake is not missed.
        let closed_rx = ctx.closed_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = ctx.run_connection(conn_id, stream, addr, closed_rx).await {
                debug!(conn_id = %conn_id, %addr, error = %e, "connection ended with error");
            }
            drop(permit);
        });
    }

    /// Begin shutdown.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Accepted connections still open, authenticated or not.
    pub fn connection_count(&self) -> usize {
        let limit = self.config.max_connections.min(Semaphore::MAX_PERMITS);
        limit - self.connection_limit.available_permits()
    }
}

impl ServerContext {
    /// One connection from handshake to cleanup.
    async fn run_connection(
        self: Arc<Self>,
        conn_id: ConnectionId,
        stream: TcpStream,
        addr: SocketAddr,
        mut closed_rx: broadcast::Receiver<()>,
    ) -> Result<(), GameServerError> {
        let mut credential = None;
        let mut ws = accept_hdr_async(stream, |request: &Request, response: Response| {
            credential = extract_credential(request);
            Ok::<Response, ErrorResponse>(response)
        })
        .await?;

        let user_id = match self.authenticate(credential) {
            Ok(user_id) => user_id,
            Err(e) => {
                info!(conn_id = %conn_id, %addr, reason = %e, "handshake rejected");
                let (code, reason) = rejection_close(&e);
                close_with(&mut ws, code, reason).await;
                return Ok(());
            }
        };
        if self.cache.is_closed() {
            debug!(conn_id = %conn_id, %addr, "handshake finished after drain");
            close_with(&mut ws, CLOSE_GOING_AWAY, REASON_SHUTDOWN).await;
            return Ok(());
        }

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
        let conn = ConnectionHandle::new(conn_id, user_id.clone(), tx);

        self.clients.write().await.insert(conn_id, ConnectedClient {
            user_id: user_id.clone(),
            addr,
            connected_at: Instant::now(),
        });
        info!(conn_id = %conn_id, user_id = %user_id, %addr, "connection accepted");

        let writer = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Outbound::Message(msg) => {
                        let text = match msg.to_json() {
                            Ok(t) => t,
                            Err(e) => {
                                error!(error = %e, "failed to serialize message");
                                continue;
                            }
                        };
                        if ws_sender.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Outbound::Close(code, reason) => {
                        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
                        let _ = ws_sender.send(Message::Close(Some(frame))).await;
                        return;
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(&conn, &text).await;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            conn.send(ServerMessage::error(ProtocolError::Binary)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(conn_id = %conn_id, "client disconnected");
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(conn_id = %conn_id, error = %e, "websocket error");
                            break;
                        }
                        // Ping/pong are answered by tungstenite.
                        Some(Ok(_)) => {}
                    }
                }
                _ = closed_rx.recv() => {
                    conn.close(CLOSE_GOING_AWAY, REASON_SHUTDOWN);
                    break;
                }
            }
        }

        // Cleanup
        self.rooms.leave(conn_id).await;
        let client = self.clients.write().await.remove(&conn_id);
        drop(conn);
        let _ = writer.await;

        if let Some(client) = client {
            info!(
                conn_id = %conn_id,
                user_id = %client.user_id,
                addr = %client.addr,
                connected_secs = client.connected_at.elapsed().as_secs(),
                "connection closed"
            );
        }
        Ok(())
    }

    fn authenticate(&self, credential: Option<String>) -> Result<UserId, AuthError> {
        let token = credential.ok_or(AuthError::MissingCredential)?;
        self.verifier.verify(&token)
    }

    /// Decode and apply one text frame.
    async fn dispatch(&self, conn: &ConnectionHandle, text: &str) {
        let message = match ClientMessage::from_json(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(conn_id = %conn.id, error = %e, "invalid message");
                conn.send(ServerMessage::error(e)).await;
                return;
            }
        };

        match message {
            ClientMessage::Join(req) => self.handle_join(conn, req).await,
            ClientMessage::Flip(req) => self.handle_flip(conn, req).await,
            ClientMessage::Match(req) => self.handle_match(conn, req).await,
            ClientMessage::Create(req) => self.handle_create(conn, req).await,
        }
    }

    async fn handle_join(&self, conn: &ConnectionHandle, req: JoinRequest) {
        let game = match self.cache.get(&req.game_id, &conn.user_id).await {
            Some(game) => Some(game),
            None => self.cache.load_or_fetch(&req.game_id, &conn.user_id).await,
        };
        let Some(game) = game else {
            conn.send(ServerMessage::error(SessionError::NotFound)).await;
            return;
        };

        self.rooms.join(&req.game_id, conn.clone()).await;
        debug!(conn_id = %conn.id, game_id = %req.game_id, "joined room");
        conn.send(ServerMessage::State(game.to_safe())).await;
    }

    async fn handle_flip(&self, conn: &ConnectionHandle, req: FlipRequest) {
        // Negative indices are as out of range as oversized ones.
        let index = usize::try_from(req.card_index).unwrap_or(usize::MAX);
        let result = self
            .cache
            .commit(&req.game_id, &conn.user_id, |game, now| flip(game, index, now))
            .await;

        match result {
            Ok(committed) => self.publish(&req.game_id, &committed).await,
            Err(e) => self.report(conn, &req.game_id, e).await,
        }
    }

    async fn handle_match(&self, conn: &ConnectionHandle, req: MatchRequest) {
        let result = self
            .cache
            .commit(&req.game_id, &conn.user_id, resolve_match)
            .await;

        match result {
            Ok(committed) => self.publish(&req.game_id, &committed).await,
            Err(e) => self.report(conn, &req.game_id, e).await,
        }
    }

    /// Broadcast a committed state while its game is still locked, so
    /// rooms see states in commit order.
    async fn publish<T>(&self, game_id: &GameId, committed: &Committed<T>) {
        let message = ServerMessage::State(committed.game().to_safe());
        self.rooms.broadcast(game_id, &message).await;
    }

    async fn handle_create(&self, conn: &ConnectionHandle, req: CreateRequest) {
        match self.cache.create(&conn.user_id, req.pairs).await {
            Ok(game) => {
                self.rooms.join(&game.id, conn.clone()).await;
                conn.send(ServerMessage::State(game.to_safe())).await;
            }
            Err(e) => {
                if let SessionError::Store(store_err) = &e {
                    error!(user_id = %conn.user_id, error = %store_err, "failed to create game");
                }
                conn.send(ServerMessage::error(e)).await;
            }
        }
    }

    /// Send a failed operation back to its sender only.
    async fn report(&self, conn: &ConnectionHandle, game_id: &GameId, err: SessionError) {
        match &err {
            SessionError::Game(game_err) if game_err.is_internal() => {
                error!(game_id = %game_id, user_id = %conn.user_id, error = %game_err, "consistency fault");
            }
            _ => {
                debug!(conn_id = %conn.id, game_id = %game_id, error = %err, "operation rejected");
            }
        }
        conn.send(ServerMessage::error(err)).await;
    }
}
