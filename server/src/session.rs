//! One connected client.
//!
//! A session is created by the accept loop as a [`PendingSession`] and handed
//! to the dispatch loop, which registers it and only then starts its reader
//! and writer tasks. Nothing a client sends can reach the dispatch loop before
//! its session is registered.
//!
//! The reader decodes envelopes and forwards them to the arrival queue. The
//! writer drains the bounded outbound queue onto the socket. Either task
//! reports a failure as a close request; only the dispatch loop actually
//! closes a session.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{EnvelopeCodec, Message};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::network::ServerEvent;
use crate::permissions::SessionPermissions;

pub type SessionId = u32;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("session is closed")]
    Closed,
}

/// An accepted connection that has not been registered yet.
pub struct PendingSession {
    addr: SocketAddr,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSession")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl PendingSession {
    pub fn new<S>(addr: SocketAddr, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            addr,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Spawns the reader and writer tasks and returns the handle the
    /// dispatch loop keeps for this session.
    pub fn start(
        self,
        id: SessionId,
        codec: EnvelopeCodec,
        outbound_capacity: usize,
        events: mpsc::Sender<ServerEvent>,
    ) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        let (notice_tx, notice_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let frames = FramedRead::new(self.reader, codec.clone());
        let sink = FramedWrite::new(self.writer, codec);

        let reader = tokio::spawn(read_loop(id, frames, events.clone(), cancel.clone()));
        let writer = tokio::spawn(write_loop(
            id,
            sink,
            outbound_rx,
            notice_rx,
            events,
            cancel.clone(),
        ));

        SessionHandle {
            tasks: vec![reader, writer],
            ..SessionHandle::new(id, self.addr, outbound_tx, notice_tx, cancel)
        }
    }
}

/// The dispatch loop's view of a session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    addr: SocketAddr,
    /// Set once the session completes login.
    pub username: Option<String>,
    pub permissions: SessionPermissions,
    pub last_ping_sent: Option<Instant>,
    pub last_ping_received: Option<Instant>,
    state: SessionState,
    outbound: mpsc::Sender<Message>,
    /// Close reason for the writer when the outbound queue has no room left
    close_notice: Option<oneshot::Sender<String>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    fn new(
        id: SessionId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
        close_notice: oneshot::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            username: None,
            permissions: SessionPermissions::default(),
            last_ping_sent: None,
            last_ping_received: None,
            state: SessionState::Open,
            outbound,
            close_notice: Some(close_notice),
            cancel,
            tasks: Vec::new(),
        }
    }

    /// A session with no socket behind it; the receiver sees everything the
    /// session is sent.
    #[cfg(test)]
    pub(crate) fn detached(id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (notice_tx, _) = oneshot::channel();
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        (Self::new(id, addr, tx, notice_tx, CancellationToken::new()), rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn is_logged_in(&self) -> bool {
        self.username.is_some()
    }

    /// Name used in logs: the username once known, otherwise the address.
    pub fn label(&self) -> String {
        match &self.username {
            Some(name) => name.clone(),
            None => format!("session {} ({})", self.id, self.addr),
        }
    }

    /// Queues a message without waiting.
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// True if a ping went out and nothing has answered it since.
    pub fn ping_overdue(&self) -> bool {
        match (self.last_ping_sent, self.last_ping_received) {
            (Some(sent), Some(received)) => received < sent,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Closes the session, telling the peer why.
    ///
    /// Waits for both tasks to finish, aborting them if they take longer than
    /// `timeout`. Calling this on a session that is already closing does
    /// nothing.
    pub async fn close(&mut self, reason: &str, timeout: Duration) {
        if self.state != SessionState::Open {
            return;
        }
        self.state = SessionState::Closing;
        info!("Closing {}: {}", self.label(), reason);

        if self.outbound.try_send(Message::close(reason)).is_err() {
            debug!("Close notice for session {} will follow its backlog", self.id);
        }
        if let Some(notice) = self.close_notice.take() {
            if notice.send(reason.to_string()).is_err() {
                debug!("Writer for session {} is already gone", self.id);
            }
        }
        self.cancel.cancel();

        let deadline = Instant::now() + timeout;
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if time::timeout_at(deadline, task).await.is_err() {
                warn!("Session {} did not stop in time, aborting", self.id);
                abort.abort();
            }
        }

        self.state = SessionState::Closed;
    }
}

/// Sends `event` unless the session is cancelled first. Returns false if the
/// event could not be delivered.
pub(crate) async fn forward(
    events: &mpsc::Sender<ServerEvent>,
    event: ServerEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn read_loop(
    id: SessionId,
    mut frames: FramedRead<BoxedReader, EnvelopeCodec>,
    events: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };

        let (event, last) = match frame {
            Some(Ok(message)) => (
                ServerEvent::MessageReceived {
                    session: id,
                    message,
                },
                false,
            ),
            Some(Err(e)) => {
                warn!("Session {} sent a bad envelope: {}", id, e);
                let reason = format!("protocol error: {}", e);
                (ServerEvent::CloseRequested { session: id, reason }, true)
            }
            None => {
                debug!("Session {} reached end of stream", id);
                let reason = "connection closed by peer".to_string();
                (ServerEvent::CloseRequested { session: id, reason }, true)
            }
        };

        if !forward(&events, event, &cancel).await || last {
            break;
        }
    }
    debug!("Reader for session {} stopped", id);
}

async fn write_loop(
    id: SessionId,
    mut sink: FramedWrite<BoxedWriter, EnvelopeCodec>,
    mut outbound: mpsc::Receiver<Message>,
    mut close_notice: oneshot::Receiver<String>,
    events: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    // Set once a close notice went out or the socket failed.
    let mut finished = false;
    loop {
        // Anything already queued is flushed before a cancellation is seen,
        // so the close notice reaches the peer.
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            _ = cancel.cancelled() => None,
        };
        let Some(message) = message else {
            break;
        };

        let closing = matches!(message, Message::Close { .. });
        if let Err(e) = sink.send(message).await {
            warn!("Failed to write to session {}: {}", id, e);
            let reason = format!("write failed: {}", e);
            forward(&events, ServerEvent::CloseRequested { session: id, reason }, &cancel).await;
            finished = true;
            break;
        }
        if closing {
            finished = true;
            break;
        }
    }

    // The queue was full when the session closed, so the notice was not
    // queued behind the backlog.
    if !finished {
        if let Ok(reason) = close_notice.try_recv() {
            if let Err(e) = sink.send(Message::close(reason)).await {
                debug!("Failed to send close notice to session {}: {}", id, e);
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Failed to shut down session {} cleanly: {}", id, e);
    }
    debug!("Writer for session {} stopped", id);
}
