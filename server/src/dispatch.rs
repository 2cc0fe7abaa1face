//! Server-side handling of each message kind.
//!
//! The dispatch loop calls [`apply_to_server`] once per arrived message, in
//! arrival order. Nothing here awaits: anything that needs to (closing a
//! session, shutting down) is queued on the state for the loop to finish.

use log::{info, warn};
use shared::Message;

use crate::commands::{parse_line, CommandRegistry};
use crate::session::SessionId;
use crate::state::ServerState;

pub fn apply_to_server(
    message: Message,
    state: &mut ServerState,
    commands: &CommandRegistry,
    source: SessionId,
) {
    let logged_in = state.username(source).is_some();
    let kind = message.kind();

    match message {
        Message::Chat { text } if logged_in => state.chat(source, &text),
        Message::Command { name, command } if logged_in => {
            commands.dispatch(state, Some(source), &name, command.as_deref());
        }
        Message::MoveUnit {
            uid, to_x, to_y, ..
        } if logged_in => state.move_unit(source, uid, to_x, to_y),
        Message::Chat { .. } | Message::Command { .. } | Message::MoveUnit { .. } => {
            warn!(
                "Ignoring {} from {} before login",
                kind,
                state.describe(Some(source))
            );
        }
        Message::Init { .. } | Message::NewUnit { .. } => {
            warn!(
                "Ignoring server-only {} from {}",
                kind,
                state.describe(Some(source))
            );
        }
        Message::Handshake { version } => state.handshake(source, &version),
        Message::Validation { name, password } => {
            if logged_in {
                warn!("{} tried to log in twice", state.describe(Some(source)));
                return;
            }
            // Rejections are logged and close the session inside.
            let _ = state.init_connection(source, &name, password.as_deref());
        }
        Message::Close { reason } => {
            info!("{} is leaving: {}", state.describe(Some(source)), reason);
            state.request_close(source, reason);
        }
        Message::Ping { from_client } => state.ping(source, from_client),
    }
}

/// Runs one line typed at the server console.
pub fn apply_console_line(state: &mut ServerState, commands: &CommandRegistry, line: &str) {
    if let Some((name, args)) = parse_line(line) {
        commands.dispatch(state, None, &name, args.as_deref());
    }
}
