//! WebSocket Game Server
//!
//! Async WebSocket server for crash game connections.
//! Runs the round engine, its ticker, and the broadcast dispatcher as
//! background tasks, and one reader/writer task pair per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{broadcast, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{check_range, env_millis, env_parse, ConfigError};
use crate::game::engine::{GameConfig, RoundEngine};
use crate::game::events::{InboundEvent, Outbound};
use crate::game::ledger::LedgerHandle;
use crate::game::state::PlayerId;
use crate::network::dispatcher::BroadcastDispatcher;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::registry::SessionRegistry;

/// How long a closing session may spend flushing its writer.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Floor for the heartbeat period.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Capacity of the engine's inbound queue.
    pub inbound_capacity: usize,
    /// Capacity of each session's outbound queue.
    pub outbound_capacity: usize,
    /// Time without any inbound frame, pongs included, after which a client
    /// is disconnected. The server pings every half of this.
    pub read_timeout: Duration,
    /// Malformed frames tolerated before disconnecting.
    pub max_protocol_errors: u32,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_sessions: 10,
            inbound_capacity: 1024,
            outbound_capacity: 64,
            read_timeout: Duration::from_secs(60),
            max_protocol_errors: 5,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CRASH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("CRASH_MAX_SESSIONS")? {
            config.max_sessions = check_range("CRASH_MAX_SESSIONS", n, 1, 100_000, "1..=100000")?;
        }
        if let Some(n) = env_parse::<usize>("CRASH_INBOUND_CAPACITY")? {
            config.inbound_capacity = check_range("CRASH_INBOUND_CAPACITY", n, 1, 1 << 20, "at least 1")?;
        }
        if let Some(n) = env_parse::<usize>("CRASH_OUTBOUND_CAPACITY")? {
            config.outbound_capacity = check_range("CRASH_OUTBOUND_CAPACITY", n, 1, 1 << 20, "at least 1")?;
        }
        if let Some(d) = env_millis("CRASH_READ_TIMEOUT_MS")? {
            if d.is_zero() {
                return Err(ConfigError::OutOfRange {
                    key: "CRASH_READ_TIMEOUT_MS",
                    reason: "must be at least 1ms",
                });
            }
            config.read_timeout = d;
        }
        if let Some(n) = env_parse::<u32>("CRASH_MAX_PROTOCOL_ERRORS")? {
            config.max_protocol_errors = check_range("CRASH_MAX_PROTOCOL_ERRORS", n, 1, u32::MAX, "at least 1")?;
        }

        Ok(config)
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
}

/// Per-connection settings shared by session tasks.
#[derive(Clone)]
struct SessionContext {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    inbound: mpsc::Sender<InboundEvent>,
}

impl SessionContext {
    /// Queue a direct reply. Returns `false` once the session should end.
    ///
    /// A client that lets its queue fill is evicted, the same as a slow
    /// broadcast consumer.
    async fn reply(
        &self,
        player_id: PlayerId,
        direct: &mpsc::WeakSender<ServerMessage>,
        message: ServerMessage,
    ) -> bool {
        let Some(sender) = direct.upgrade() else {
            return false;
        };
        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("{} is not reading its replies; disconnecting", player_id);
                self.registry.evict(player_id).await;
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Round timing and economics.
    game_config: GameConfig,
    /// Live sessions.
    registry: Arc<SessionRegistry>,
    /// Settled rounds.
    ledger: LedgerHandle,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, game_config: GameConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            registry: Arc::new(SessionRegistry::new(config.max_sessions)),
            config,
            game_config,
            ledger: LedgerHandle::new(),
            shutdown_tx,
        }
    }

    /// Bind the configured address and run until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(
            "Crash server v{} listening on {}",
            self.config.version, self.config.bind_addr
        );
        self.serve(listener).await
    }

    /// Run on an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let engine = RoundEngine::new(self.game_config.clone(), self.ledger.clone(), Instant::now());
        info!(
            "Rounds: {:?} betting, {:?} pause, {:?} ticks, edge {:.2}%",
            self.game_config.bet_window,
            self.game_config.round_pause,
            self.game_config.tick_interval,
            self.game_config.crash.house_edge * 100.0
        );

        let engine_handle = tokio::spawn(Self::run_engine_loop(engine, inbound_rx, outbound_tx));
        let ticker_handle = tokio::spawn(Self::run_ticker(
            self.game_config.tick_interval,
            inbound_tx.clone(),
        ));
        let dispatcher_handle =
            tokio::spawn(BroadcastDispatcher::new(self.registry.clone()).run(outbound_rx));

        let context = SessionContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            inbound: inbound_tx,
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr, context.clone());
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

        ticker_handle.abort();
        engine_handle.abort();
        dispatcher_handle.abort();

        let stats = self.ledger.read().stats();
        info!(
            "Settled {} rounds: {} bets, wagered {:.2}, paid {:.2}",
            stats.rounds, stats.bets, stats.total_wagered, stats.total_paid
        );

        Ok(())
    }

    /// Single consumer of the inbound queue.
    async fn run_engine_loop(
        mut engine: RoundEngine,
        mut inbound: mpsc::Receiver<InboundEvent>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        for event in engine.announce() {
            if outbound.send(event).is_err() {
                return;
            }
        }

        while let Some(event) = inbound.recv().await {
            // The clock is read at dequeue, so queue order decides races
            for event in engine.handle(event, Instant::now()) {
                if outbound.send(event).is_err() {
                    return;
                }
            }
        }
    }

    /// Enqueue a tick every `period`. Ticks wait for queue space rather
    /// than being dropped.
    async fn run_ticker(period: Duration, inbound: mpsc::Sender<InboundEvent>) {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if inbound.send(InboundEvent::Tick).await.is_err() {
                break;
            }
        }
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, context: SessionContext) {
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if let Err(e) = Self::run_session(stream, addr, context, shutdown_rx).await {
                debug!("Session {} ended with error: {}", addr, e);
            }
        });
    }

    async fn run_session(
        stream: TcpStream,
        addr: SocketAddr,
        context: SessionContext,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), GameServerError> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(context.config.outbound_capacity);

        // The registry keeps the only strong sender; this task replies
        // through a weak one so dropping the registry entry ends the writer.
        let direct = msg_tx.downgrade();
        let evicted = Arc::new(Notify::new());
        let player_id = match context.registry.register(addr, msg_tx, evicted.clone()).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejecting {}: {}", addr, e);
                let refusal = ServerMessage::error(ErrorCode::CapacityExceeded, e.to_string());
                if let Ok(text) = refusal.to_json() {
                    ws_sender.send(Message::Text(text)).await?;
                }
                ws_sender.close().await?;
                return Ok(());
            }
        };
        info!("{} connected from {}", player_id, addr);

        let read_timeout = context.config.read_timeout;

        // Spawn message sender task. Its pings keep a quiet but live client
        // inside the read deadline, since the auto-pong is an inbound frame.
        let mut writer = tokio::spawn(async move {
            let mut ping = interval((read_timeout / 2).max(MIN_PING_INTERVAL));
            ping.reset();

            loop {
                let frame = tokio::select! {
                    msg = msg_rx.recv() => match msg {
                        Some(msg) => match msg.to_json() {
                            Ok(text) => Message::Text(text),
                            Err(e) => {
                                error!("Failed to serialize message: {}", e);
                                continue;
                            }
                        },
                        None => break,
                    },
                    _ = ping.tick() => Message::Ping(Vec::new()),
                };
                if ws_sender.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        // A full queue here evicts, which the loop below picks up
        context
            .reply(player_id, &direct, ServerMessage::welcome(player_id))
            .await;

        let mut strikes = 0u32;

        loop {
            tokio::select! {
                frame = timeout(read_timeout, ws_receiver.next()) => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(_) => {
                            info!("{} idle for {:?}, closing", player_id, read_timeout);
                            break;
                        }
                    };

                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(_))) => {
                            strikes += 1;
                            let refusal = ServerMessage::error(
                                ErrorCode::InvalidRequest,
                                "Binary frames are not supported",
                            );
                            if !context.reply(player_id, &direct, refusal).await {
                                break;
                            }
                            if strikes >= context.config.max_protocol_errors {
                                warn!("{} sent {} malformed frames, disconnecting", player_id, strikes);
                                break;
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("{} disconnected", player_id);
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("WebSocket error for {}: {}", player_id, e);
                            break;
                        }
                        // Pongs only refresh the deadline
                        Some(Ok(_)) => continue,
                    };

                    let request = match ClientMessage::from_json(&text) {
                        Ok(msg) => {
                            strikes = 0;
                            msg.to_request()
                        }
                        Err(e) => {
                            strikes += 1;
                            debug!("Invalid message from {}: {}", player_id, e);
                            let refusal = ServerMessage::error(
                                ErrorCode::InvalidRequest,
                                format!("Invalid message: {}", e),
                            );
                            if !context.reply(player_id, &direct, refusal).await {
                                break;
                            }
                            if strikes >= context.config.max_protocol_errors {
                                warn!("{} sent {} malformed frames, disconnecting", player_id, strikes);
                                break;
                            }
                            continue;
                        }
                    };

                    match context.inbound.try_send(InboundEvent::Request { player_id, request }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("Engine queue full, refusing request from {}", player_id);
                            let refusal = ServerMessage::error(ErrorCode::Busy, "Server busy, try again");
                            if !context.reply(player_id, &direct, refusal).await {
                                break;
                            }
                        }
                        Err(TrySendError::Closed(_)) => {
                            error!("Engine stopped, closing {}", player_id);
                            break;
                        }
                    }
                }
                _ = &mut writer => {
                    debug!("Writer for {} closed", player_id);
                    break;
                }
                _ = evicted.notified() => {
                    info!("{} evicted", player_id);
                    break;
                }
                _ = shutdown_rx.recv() => {
                    context
                        .reply(player_id, &direct, ServerMessage::info("Server shutting down"))
                        .await;
                    break;
                }
            }
        }

        // Cleanup
        context.registry.unregister(player_id).await;
        if context
            .inbound
            .send(InboundEvent::Disconnected { player_id })
            .await
            .is_err()
        {
            debug!("Engine gone before {} disconnect was recorded", player_id);
        }

        if !writer.is_finished() {
            let _ = timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await;
            writer.abort();
        }

        info!("{} left", player_id);
        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Whether `player_id` currently holds a session.
    pub async fn is_connected(&self, player_id: PlayerId) -> bool {
        self.registry.lookup(player_id).await.is_some()
    }

    /// Settled round history.
    pub fn ledger(&self) -> LedgerHandle {
        self.ledger.clone()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crash::CrashModel;
    use std::net::Ipv4Addr;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn session_context(inbound: mpsc::Sender<InboundEvent>) -> SessionContext {
        SessionContext {
            config: ServerConfig::default(),
            registry: Arc::new(SessionRegistry::new(4)),
            inbound,
        }
    }

    /// Run one session on loopback. The returned sender must outlive the
    /// session, since a closed shutdown channel ends it.
    async fn open_session(context: SessionContext) -> (Client, broadcast::Sender<()>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = GameServer::run_session(stream, peer, context, shutdown_rx).await;
        });

        let (client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        (client, shutdown_tx)
    }

    /// Next server message, or `None` once the connection closes.
    async fn next_message(client: &mut Client) -> Option<ServerMessage> {
        loop {
            match timeout(Duration::from_secs(5), client.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => return Some(ServerMessage::from_json(&text).unwrap()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    fn test_game_config() -> GameConfig {
        GameConfig {
            bet_window: Duration::from_millis(200),
            round_pause: Duration::from_millis(100),
            tick_interval: Duration::from_millis(10),
            crash: CrashModel {
                growth_rate: 5.0,
                ..Default::default()
            },
            seed: 7,
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.inbound_capacity, 1024);
        assert_eq!(config.outbound_capacity, 64);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.max_protocol_errors, 5);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config, test_game_config());

        assert_eq!(server.connection_count().await, 0);
        assert!(server.ledger().read().is_empty());
        assert!(!server.is_connected(PlayerId::new(1)).await);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = Arc::new(GameServer::new(ServerConfig::default(), test_game_config()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = server.clone();
        let handle = tokio::spawn(async move { running.serve(listener).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let result = timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_rounds_settle_without_players() {
        let server = Arc::new(GameServer::new(ServerConfig::default(), test_game_config()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });

        // Rounds keep cycling with nobody connected
        let ledger = server.ledger();
        let settled = timeout(Duration::from_secs(30), async {
            while ledger.read().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(settled.is_ok());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_reply_to_full_queue_evicts() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(4);
        let context = session_context(inbound_tx);
        let (tx, _rx) = mpsc::channel(1);
        let evicted = Arc::new(Notify::new());
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9000));
        let id = context.registry.register(addr, tx.clone(), evicted.clone()).await.unwrap();
        let direct = tx.downgrade();
        drop(tx);

        assert!(context.reply(id, &direct, ServerMessage::welcome(id)).await);
        assert!(!context.reply(id, &direct, ServerMessage::info("dropped")).await);

        assert!(context.registry.lookup(id).await.is_none());
        timeout(Duration::from_secs(1), evicted.notified()).await.unwrap();

        // Once the registry lets go, replies have nowhere to go
        assert!(!context.reply(id, &direct, ServerMessage::info("late")).await);
    }

    #[tokio::test]
    async fn test_full_engine_queue_replies_busy() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(1);
        inbound_tx.try_send(InboundEvent::Tick).unwrap();
        let (mut client, _shutdown) = open_session(session_context(inbound_tx)).await;

        assert!(matches!(
            next_message(&mut client).await,
            Some(ServerMessage::Info { player_id: Some(_), .. })
        ));

        for _ in 0..2 {
            client
                .send(Message::Text(r#"{"type":"bet","amount":5}"#.to_string()))
                .await
                .unwrap();
            match next_message(&mut client).await {
                Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::Busy),
                other => panic!("expected busy, got {:?}", other),
            }
        }

        // Refused requests never reach the engine
        assert!(matches!(inbound_rx.try_recv(), Ok(InboundEvent::Tick)));
        assert!(inbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_evicted_session_closes_and_reports_disconnect() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let context = session_context(inbound_tx);
        let registry = context.registry.clone();
        let (mut client, _shutdown) = open_session(context).await;

        let id = match next_message(&mut client).await {
            Some(ServerMessage::Info { player_id: Some(id), .. }) => id,
            other => panic!("expected welcome, got {:?}", other),
        };

        assert!(registry.evict(id).await);

        // The engine hears about it, so a pending bet is forfeited
        match timeout(Duration::from_secs(5), inbound_rx.recv()).await.unwrap() {
            Some(InboundEvent::Disconnected { player_id }) => assert_eq!(player_id, id),
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert!(next_message(&mut client).await.is_none());
    }

    #[tokio::test]
    async fn test_engine_loop_announces_first_round() {
        let engine = RoundEngine::new(
            test_game_config(),
            LedgerHandle::new(),
            Instant::now(),
        );
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(GameServer::run_engine_loop(engine, inbound_rx, outbound_tx));
        inbound_tx.send(InboundEvent::bet(PlayerId::new(1), 5.0)).await.unwrap();
        drop(inbound_tx);
        handle.await.unwrap();

        let first = outbound_rx.recv().await.unwrap();
        assert!(matches!(
            first.data,
            crate::game::events::EngineEventData::PhaseChanged { .. }
        ));
        let second = outbound_rx.recv().await.unwrap();
        assert!(matches!(
            second.data,
            crate::game::events::EngineEventData::BetAccepted { .. }
        ));
    }
}
