//! WebSocket Game Server
//!
//! Async WebSocket transport. Each connection gets a reader task that parses
//! client messages into [`Command`]s and a writer task that drains its
//! outbound queue. A single dispatcher task owns the [`Coordinator`] and
//! drives its timers; ticker tasks feed it matchmaking, watchdog and garbage
//! flush commands.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant as TokioInstant, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::game::state::ParticipantId;
use crate::network::auth::AuthConfig;
use crate::network::coordinator::{Command, Coordinator, CoordinatorConfig, Outbound};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::store::{AccountStore, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Account file. `None` keeps accounts in memory.
    pub accounts_path: Option<PathBuf>,
    /// Queue pairing period.
    pub matchmaking_interval: Duration,
    /// Watchdog period.
    pub watchdog_interval: Duration,
    /// Garbage carry flush period.
    pub garbage_flush_interval: Duration,
    /// Per-connection outbound queue length.
    pub outbound_buffer: usize,
    /// Game rules, identity settings and version string.
    pub game: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_connections: 1000,
            accounts_path: Some(PathBuf::from("accounts.json")),
            matchmaking_interval: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(1),
            garbage_flush_interval: Duration::from_millis(250),
            outbound_buffer: 64,
            game: CoordinatorConfig {
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `BLOCKFALL_BIND`, `BLOCKFALL_ACCOUNTS` and the
    /// `AUTH_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(addr) = std::env::var("BLOCKFALL_BIND").ok().and_then(|v| v.parse().ok()) {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("BLOCKFALL_ACCOUNTS") {
            config.accounts_path = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }
        config.game.auth = AuthConfig::from_env();
        config
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Account store could not be opened.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Coordinator, taken by the dispatcher when the server runs.
    coordinator: std::sync::Mutex<Option<Coordinator>>,
    /// Command channel into the dispatcher.
    commands: mpsc::UnboundedSender<Command>,
    command_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    /// Open connections.
    connections: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server over `store`.
    pub fn new(config: ServerConfig, store: Box<dyn AccountStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(config.game.clone(), store);

        Self {
            config,
            coordinator: std::sync::Mutex::new(Some(coordinator)),
            commands,
            command_rx: std::sync::Mutex::new(Some(command_rx)),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Run the server until [`GameServer::shutdown`] is called.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Game server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let coordinator = self
            .coordinator
            .lock()
            .map_err(|_| GameServerError::Internal("coordinator lock poisoned".into()))?
            .take()
            .ok_or_else(|| GameServerError::Internal("server already running".into()))?;
        let command_rx = self
            .command_rx
            .lock()
            .map_err(|_| GameServerError::Internal("command lock poisoned".into()))?
            .take()
            .ok_or_else(|| GameServerError::Internal("server already running".into()))?;

        let dispatcher = tokio::spawn(Self::run_dispatcher(coordinator, command_rx, self.shutdown_tx.subscribe()));
        let schedule: [(Duration, fn() -> Command); 3] = [
            (self.config.matchmaking_interval, || Command::MatchmakingTick),
            (self.config.watchdog_interval, || Command::Sweep),
            (self.config.garbage_flush_interval, || Command::FlushGarbage),
        ];
        let tickers = schedule.map(|(period, make)| tokio::spawn(Self::run_ticker(period, make, self.commands.clone())));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        for ticker in tickers {
            ticker.abort();
        }
        if let Err(e) = dispatcher.await {
            error!("Dispatcher task failed: {}", e);
        }
        Ok(())
    }

    /// Own the coordinator: apply commands in arrival order and fire timers.
    async fn run_dispatcher(
        mut coordinator: Coordinator,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let deadline = coordinator.next_deadline().map(TokioInstant::from_std);

            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => coordinator.handle(cmd, std::time::Instant::now()),
                        None => break,
                    }
                }
                _ = async {
                    match deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    coordinator.fire_due(std::time::Instant::now());
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
        info!(
            "Dispatcher stopped with {} connections, {} contests",
            coordinator.connection_count(),
            coordinator.session_count()
        );
    }

    /// Feed a periodic command to the dispatcher.
    async fn run_ticker(period: Duration, make: fn() -> Command, commands: mpsc::UnboundedSender<Command>) {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if commands.send(make()).is_err() {
                break;
            }
        }
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let commands = self.commands.clone();
        let connections = self.connections.clone();
        let buffer = self.config.outbound_buffer;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    connections.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };

            let id = ParticipantId::random();
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(buffer);

            if commands.send(Command::Connect { id, tx: out_tx.clone() }).is_err() {
                connections.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            info!("{} connected as {}", addr, id.short());

            // Fires once the writer has sent a close frame
            let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(item) = out_rx.recv().await {
                    let text = match item {
                        Outbound::Message(msg) => match msg.to_json() {
                            Ok(t) => t,
                            Err(e) => {
                                error!("Failed to serialize message: {}", e);
                                continue;
                            }
                        },
                        Outbound::Close => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            let _ = closed_tx.send(());
                            break;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(msg) => {
                                        if commands.send(Command::Client { id, msg }).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let reply = ServerMessage::error(ErrorCode::InvalidInput, "Invalid message format");
                                        let _ = out_tx.try_send(Outbound::Message(reply));
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = &mut closed_rx => {
                        debug!("Closed {} from the server side", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = out_tx.try_send(Outbound::Message(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }));
                        let _ = out_tx.try_send(Outbound::Close);
                        break;
                    }
                }
            }

            // Disconnect is handled like a leave by the coordinator
            let _ = commands.send(Command::Disconnect { id });
            drop(out_tx);
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Writer for {} did not finish in time", addr);
            }
            connections.fetch_sub(1, Ordering::Relaxed);
            info!("Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
