//! Text commands typed as `/name arguments`.
//!
//! Each command owns a permission, a usage string and an argument pattern.
//! The registry looks commands up by name, checks the issuer's permission
//! (the console is exempt), validates the arguments against the pattern and
//! only then runs the handler.

use log::info;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

use crate::builtins;
use crate::session::SessionId;
use crate::state::ServerState;

/// Runs a command whose arguments matched its pattern. `source` is `None`
/// for the server console.
pub type Handler = fn(&mut ServerState, Option<SessionId>, &Captures<'_>);

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command name must not be empty")]
    EmptyName,
    #[error("command \"{0}\" is already registered")]
    Duplicate(String),
    #[error("invalid argument pattern for \"{name}\": {source}")]
    Pattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

pub struct Command {
    name: String,
    permission: String,
    usage: String,
    pattern: Regex,
    handler: Handler,
}

impl Command {
    pub fn new(
        name: &str,
        permission: &str,
        usage: &str,
        pattern: &str,
        handler: Handler,
    ) -> Result<Self, CommandError> {
        let pattern = Regex::new(pattern).map_err(|source| CommandError::Pattern {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            permission: permission.to_string(),
            usage: usage.to_string(),
            pattern,
            handler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }

    pub fn usage(&self) -> &str {
        &self.usage
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in commands.
    pub fn standard() -> Result<Self, CommandError> {
        let mut registry = Self::new();
        builtins::register_all(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, command: Command) -> Result<(), CommandError> {
        if command.name.is_empty() {
            return Err(CommandError::EmptyName);
        }
        if self.commands.contains_key(&command.name) {
            return Err(CommandError::Duplicate(command.name));
        }
        self.commands.insert(command.name.clone(), command);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Permissions of every registered command, for registering in the
    /// permission tree at startup.
    pub fn permissions(&self) -> impl Iterator<Item = &str> {
        self.commands.values().map(Command::permission)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Runs `name` with `args` on behalf of `source`. Returns true if the
    /// handler ran.
    pub fn dispatch(
        &self,
        state: &mut ServerState,
        source: Option<SessionId>,
        name: &str,
        args: Option<&str>,
    ) -> bool {
        let Some(command) = self.commands.get(name) else {
            info!("{} issued unknown command /{}", state.describe(source), name);
            state.reply(source, &format!("unknown command \"{}\"", name));
            return false;
        };

        if !state.has_permission(source, command.permission()) {
            info!(
                "{} lacks {} for /{}",
                state.describe(source),
                command.permission(),
                command.name()
            );
            state.reply(
                source,
                &format!("you do not have permission to use \"/{}\"", command.name()),
            );
            return false;
        }

        let args = args.unwrap_or("");
        let Some(captures) = command.pattern.captures(args) else {
            info!("{} issued invalid /{} {}", state.describe(source), name, args);
            let issued = format!("{} {}", name, args);
            state.reply(
                source,
                &format!(
                    "invalid command \"{}\" expected \"{}\"",
                    issued.trim_end(),
                    command.usage()
                ),
            );
            return false;
        };

        info!("{} ran /{} {}", state.describe(source), command.name(), args);
        (command.handler)(state, source, &captures);
        true
    }
}

/// Splits a typed line into command name and remaining text. A leading `/`
/// is optional. Returns `None` for a blank line.
pub fn parse_line(line: &str) -> Option<(String, Option<String>)> {
    let line = line.trim();
    let line = line.strip_prefix('/').unwrap_or(line).trim_start();
    if line.is_empty() {
        return None;
    }

    match line.split_once(' ') {
        Some((name, rest)) => {
            let rest = rest.trim();
            let rest = (!rest.is_empty()).then(|| rest.to_string());
            Some((name.to_string(), rest))
        }
        None => Some((line.to_string(), None)),
    }
}
