//! Server network layer: TCP accept loop and the single dispatch loop

use log::{debug, error, info, warn};
use shared::{EnvelopeCodec, Message, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands::CommandRegistry;
use crate::config::ServerConfig;
use crate::dispatch::{apply_console_line, apply_to_server};
use crate::error::ServerError;
use crate::keepalive::{schedule_keepalive, sweep};
use crate::permissions::{PermissionStore, PermissionTree};
use crate::scheduler::Scheduler;
use crate::session::{forward, PendingSession, SessionId};
use crate::state::ServerState;
use crate::users::UserStore;

pub const SHUTDOWN_REASON: &str = "Server closing.";

/// Everything that reaches the dispatch loop, in arrival order
#[derive(Debug)]
pub enum ServerEvent {
    /// A new connection waiting to be registered and started
    Connected(PendingSession),
    MessageReceived {
        session: SessionId,
        message: Message,
    },
    /// A reader or writer gave up on its connection
    CloseRequested {
        session: SessionId,
        reason: String,
    },
    /// A line typed at the server console
    Console(String),
    Keepalive,
    Shutdown,
}

/// Cloneable handle for talking to a running server from outside the
/// dispatch loop
#[derive(Debug, Clone)]
pub struct ServerHandle {
    events: mpsc::Sender<ServerEvent>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Submits a console line. Returns false once the server has stopped.
    pub async fn console(&self, line: impl Into<String>) -> bool {
        self.events.send(ServerEvent::Console(line.into())).await.is_ok()
    }

    /// Asks the server to shut down cleanly, as `/stop` would.
    pub async fn shutdown(&self) -> bool {
        self.events.send(ServerEvent::Shutdown).await.is_ok()
    }
}

/// Main server: owns the listener, the arrival queue and all shared state
pub struct Server {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    state: ServerState,
    commands: CommandRegistry,
    codec: EnvelopeCodec,
    scheduler: Scheduler,
    scheduler_worker: JoinHandle<()>,
    cancel: CancellationToken,

    // Arrival queue
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: mpsc::Receiver<ServerEvent>,
}

impl Server {
    /// Binds the listener and loads every on-disk store.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let commands = CommandRegistry::standard()?;
        let mut tree = PermissionTree::new();
        for permission in commands.permissions() {
            if let Err(e) = tree.register(permission) {
                warn!("Command permission not registered: {}", e);
            }
        }

        let permissions = PermissionStore::load(
            tree,
            &config.groups_dir(),
            &config.user_permissions_dir(),
            &config.default_group,
        )?;
        let users = UserStore::load(config.users_path())?;

        let codec = EnvelopeCodec::with_max_length(
            Arc::new(Registry::standard()),
            config.max_line_length,
        );
        let (scheduler, scheduler_worker) = Scheduler::start();
        let (events_tx, events_rx) = mpsc::channel(config.arrival_capacity);

        Ok(Server {
            listener: Arc::new(listener),
            local_addr,
            state: ServerState::new(config, users, permissions),
            commands,
            codec,
            scheduler,
            scheduler_worker,
            cancel: CancellationToken::new(),
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            events: self.events_tx.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Runs until `/stop`, a shutdown request or a fatal error, then closes
    /// every session and saves the user store.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let accept = tokio::spawn(accept_loop(
            Arc::clone(&self.listener),
            self.events_tx.clone(),
            self.cancel.clone(),
        ));
        schedule_keepalive(
            &self.scheduler,
            self.events_tx.clone(),
            self.state.config.ping_interval,
        );

        info!("Server started successfully");

        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event);
            self.process_close_requests().await;

            if self.state.shutdown_requested() {
                break;
            }
        }

        self.shutdown(accept).await
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected(pending) => {
                let id = self.state.sessions.allocate_id();
                let addr = pending.addr();
                let session = pending.start(
                    id,
                    self.codec.clone(),
                    self.state.config.outbound_capacity,
                    self.events_tx.clone(),
                );
                self.state.sessions.insert(session);
                debug!("Session {} started for {}", id, addr);
            }
            ServerEvent::MessageReceived { session, message } => {
                let open = self
                    .state
                    .sessions
                    .get(session)
                    .is_some_and(|s| s.is_open());
                if open {
                    apply_to_server(message, &mut self.state, &self.commands, session);
                } else {
                    debug!("Dropping {} for closed session {}", message.kind(), session);
                }
            }
            ServerEvent::CloseRequested { session, reason } => {
                self.state.request_close(session, reason);
            }
            ServerEvent::Console(line) => {
                apply_console_line(&mut self.state, &self.commands, &line);
            }
            ServerEvent::Keepalive => {
                sweep(&mut self.state, tokio::time::Instant::now());
                schedule_keepalive(
                    &self.scheduler,
                    self.events_tx.clone(),
                    self.state.config.ping_interval,
                );
            }
            ServerEvent::Shutdown => self.state.request_shutdown(),
        }
    }

    /// Closes every session that asked to be closed, announcing the
    /// departure of those that had logged in.
    async fn process_close_requests(&mut self) {
        let timeout = self.state.config.close_timeout;
        while let Some((id, reason)) = self.state.next_close_request() {
            let Some(mut session) = self.state.sessions.remove(id) else {
                continue;
            };
            session.close(&reason, timeout).await;

            if let Some(name) = session.username.take() {
                info!("{} disconnected: {}", name, reason);
                self.state.broadcast(Message::chat(format!("{} has left.", name)));
            }
        }
    }

    async fn shutdown(mut self, accept: JoinHandle<()>) -> Result<(), ServerError> {
        info!("Server shutting down");
        self.scheduler.cancel();
        self.cancel.cancel();
        if let Err(e) = accept.await {
            error!("Accept loop failed: {}", e);
        }

        let timeout = self.state.config.close_timeout;
        for id in self.state.sessions.ids() {
            if let Some(mut session) = self.state.sessions.remove(id) {
                session.close(SHUTDOWN_REASON, timeout).await;
            }
        }

        let saved = self.state.users.save();
        if let Err(e) = self.scheduler_worker.await {
            error!("Scheduler worker failed: {}", e);
        }
        saved?;

        info!("Closing server, goodbye");
        Ok(())
    }
}

/// Accepts connections until cancelled and hands each to the dispatch loop
async fn accept_loop(
    listener: Arc<TcpListener>,
    events: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                info!("Accepted connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                }
                let pending = PendingSession::new(addr, stream);
                if !forward(&events, ServerEvent::Connected(pending), &cancel).await {
                    break;
                }
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Accept loop stopped");
}
