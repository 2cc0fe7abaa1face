//! Everything the dispatch loop owns: sessions, board, users and permissions.
//!
//! All mutation happens through `&mut ServerState` inside the single dispatch
//! loop, so every broadcast is totally ordered with respect to every other.
//! Operations that need to await (closing a session) are queued here as
//! close requests and carried out by the loop between events.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::Message;
use std::collections::VecDeque;
use tokio::time::Instant;

use crate::board::Board;
use crate::config::ServerConfig;
use crate::permissions::PermissionStore;
use crate::session::{SendError, SessionId};
use crate::session_manager::SessionManager;
use crate::users::UserStore;

/// Why a login attempt was refused. The message is sent to the client as
/// the close reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginRejection {
    #[error("invalid username")]
    BlankUsername,
    #[error("duplicate username: {0}")]
    DuplicateUsername(String),
    #[error("invalid password")]
    InvalidPassword,
    #[error("unknown session")]
    UnknownSession,
}

pub struct ServerState {
    pub config: ServerConfig,
    pub sessions: SessionManager,
    pub board: Board,
    pub users: UserStore,
    pub permissions: PermissionStore,
    rng: StdRng,
    close_requests: VecDeque<(SessionId, String)>,
    shutdown_requested: bool,
}

impl ServerState {
    pub fn new(config: ServerConfig, users: UserStore, permissions: PermissionStore) -> Self {
        let board = Board::new(config.board_width, config.board_height);
        Self {
            config,
            sessions: SessionManager::new(),
            board,
            users,
            permissions,
            rng: StdRng::from_entropy(),
            close_requests: VecDeque::new(),
            shutdown_requested: false,
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Who issued something, for log lines.
    pub fn describe(&self, source: Option<SessionId>) -> String {
        match source {
            None => "console".to_string(),
            Some(id) => match self.sessions.get(id) {
                Some(session) => session.label(),
                None => format!("session {}", id),
            },
        }
    }

    pub fn username(&self, id: SessionId) -> Option<&str> {
        self.sessions.get(id)?.username.as_deref()
    }

    /// Queues `message` for every open, logged-in session.
    ///
    /// A session whose outbound queue is full is scheduled for closing
    /// instead of stalling everyone else.
    pub fn broadcast(&mut self, message: Message) {
        let mut overflowed = Vec::new();
        for session in self.sessions.iter() {
            if !session.is_open() || !session.is_logged_in() {
                continue;
            }
            match session.send(message.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => overflowed.push(session.id()),
                Err(SendError::Closed) => debug!("Skipping closed session {}", session.id()),
            }
        }

        for id in overflowed {
            warn!("Session {} cannot keep up with broadcasts", id);
            self.request_close(id, "send queue overflow");
        }
    }

    /// Queues `message` for a single session.
    pub fn send_to(&mut self, id: SessionId, message: Message) {
        let result = match self.sessions.get(id) {
            Some(session) => session.send(message),
            None => return,
        };
        match result {
            Ok(()) => {}
            Err(SendError::Full) => {
                warn!("Session {} outbound queue is full", id);
                self.request_close(id, "send queue overflow");
            }
            Err(SendError::Closed) => debug!("Dropping message for closed session {}", id),
        }
    }

    /// Answers whoever issued a command: a chat line for a session, a log
    /// line for the console.
    pub fn reply(&mut self, source: Option<SessionId>, text: &str) {
        match source {
            Some(id) => self.send_to(id, Message::chat(text)),
            None => info!("{}", text),
        }
    }

    /// Asks the dispatch loop to close a session once the current event is
    /// handled.
    pub fn request_close(&mut self, id: SessionId, reason: impl Into<String>) {
        if self.close_requests.iter().any(|(queued, _)| *queued == id) {
            return;
        }
        self.close_requests.push_back((id, reason.into()));
    }

    pub fn next_close_request(&mut self) -> Option<(SessionId, String)> {
        self.close_requests.pop_front()
    }

    pub fn request_shutdown(&mut self) {
        info!("Server shutdown requested");
        self.shutdown_requested = true;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// The console always has permission. Sessions need a grant.
    pub fn has_permission(&self, source: Option<SessionId>, permission: &str) -> bool {
        match source {
            None => true,
            Some(id) => self
                .sessions
                .get(id)
                .is_some_and(|session| self.permissions.check(permission, &session.permissions)),
        }
    }

    /// Checks the peer's protocol version and answers with ours.
    pub fn handshake(&mut self, id: SessionId, version: &str) {
        if version != self.config.version {
            info!(
                "{} uses version {}, expected {}",
                self.describe(Some(id)),
                version,
                self.config.version
            );
            self.request_close(id, format!("wrong version: {}.", version));
            return;
        }

        let reply = Message::Handshake {
            version: self.config.version.clone(),
        };
        self.send_to(id, reply);
    }

    /// Logs a session in.
    ///
    /// First-time usernames are registered on the spot, with the supplied
    /// password if any. On success the session receives the board size and
    /// every unit, and everyone is told about the newcomer. On failure the
    /// session is closed with the rejection as the reason.
    pub fn init_connection(
        &mut self,
        id: SessionId,
        name: &str,
        password: Option<&str>,
    ) -> Result<(), LoginRejection> {
        if let Err(rejection) = self.validate_login(id, name, password) {
            info!(
                "Rejected login of {:?} from {}: {}",
                name,
                self.describe(Some(id)),
                rejection
            );
            self.request_close(id, rejection.to_string());
            return Err(rejection);
        }

        let name = name.trim();
        if !self.sessions.bind_username(id, name) {
            let rejection = LoginRejection::DuplicateUsername(name.to_string());
            self.request_close(id, rejection.to_string());
            return Err(rejection);
        }

        let permissions = self.permissions.permissions_for(name);
        if let Some(session) = self.sessions.get_mut(id) {
            info!("{} logged in with group {}", name, permissions.group);
            session.permissions = permissions;
        }

        let init = Message::Init {
            x: self.board.width,
            y: self.board.height,
        };
        let units: Vec<Message> = self
            .board
            .units()
            .map(|unit| Message::NewUnit { unit: unit.clone() })
            .collect();

        self.send_to(id, init);
        for unit in units {
            self.send_to(id, unit);
        }
        self.broadcast(Message::chat(format!("{} has joined.", name)));
        Ok(())
    }

    fn validate_login(
        &mut self,
        id: SessionId,
        name: &str,
        password: Option<&str>,
    ) -> Result<(), LoginRejection> {
        if self.sessions.get(id).is_none() {
            return Err(LoginRejection::UnknownSession);
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(LoginRejection::BlankUsername);
        }
        if self.sessions.find_by_username(name).is_some() {
            return Err(LoginRejection::DuplicateUsername(name.to_string()));
        }

        if !self.users.is_registered(name) {
            self.users.register(name, password.map(str::to_string));
            return Ok(());
        }
        if !self.users.check_password(name, password) {
            return Err(LoginRejection::InvalidPassword);
        }
        Ok(())
    }

    /// Broadcasts a chat line from a logged-in session.
    pub fn chat(&mut self, id: SessionId, text: &str) {
        let Some(name) = self.username(id) else {
            return;
        };
        let line = format!("{}: {}", name, text);
        self.broadcast(Message::chat(line));
    }

    /// Moves a unit for a session and broadcasts where it really came from.
    pub fn move_unit(&mut self, id: SessionId, uid: i32, to_x: i32, to_y: i32) {
        match self.board.move_unit(uid, to_x, to_y) {
            Some((from_x, from_y)) => self.broadcast(Message::MoveUnit {
                uid,
                to_x,
                to_y,
                from_x,
                from_y,
            }),
            None => info!(
                "{} tried to move unit {} to ({}, {})",
                self.describe(Some(id)),
                uid,
                to_x,
                to_y
            ),
        }
    }

    /// Handles a ping envelope from a session.
    pub fn ping(&mut self, id: SessionId, from_client: bool) {
        if from_client {
            self.send_to(id, Message::Ping { from_client: true });
            return;
        }
        if let Some(session) = self.sessions.get_mut(id) {
            session.last_ping_received = Some(Instant::now());
        }
    }
}
