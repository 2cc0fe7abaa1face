//! The commands every server ships with: `/roll`, `/setup`, `/add` and
//! `/stop`.

use log::warn;
use rand::Rng;
use regex::Captures;
use shared::{Color, Message};
use std::str::FromStr;

use crate::commands::{Command, CommandError, CommandRegistry};
use crate::session::SessionId;
use crate::state::ServerState;

pub const MAX_DICE: u32 = 10;
pub const MAX_SIDES: u32 = 100;

pub fn register_all(registry: &mut CommandRegistry) -> Result<(), CommandError> {
    registry.register(Command::new(
        "roll",
        "hexmap.commands.roll",
        "/roll[ private] <int>d<int>[(+|-)<int>]",
        r"\A(private )?([1-9][0-9]{0,8})d([1-9][0-9]{0,8}) ?([+-][1-9][0-9]{0,8})?\z",
        roll,
    )?)?;
    registry.register(Command::new(
        "setup",
        "hexmap.commands.setup",
        "/setup <x> <y>",
        r"\A([1-9][0-9]{0,4}) ([1-9][0-9]{0,4})\z",
        setup,
    )?)?;
    registry.register(Command::new(
        "add",
        "hexmap.commands.add",
        "/add <name> <x> <y> <r> <g> <b>",
        r"\A([a-zA-Z0-9]+) ([0-9]{1,5}) ([0-9]{1,5}) ([0-9]{1,3}) ([0-9]{1,3}) ([0-9]{1,3})\z",
        add_unit,
    )?)?;
    registry.register(Command::new(
        "stop",
        "hexmap.commands.stop",
        "/stop",
        r"\A\z",
        stop,
    )?)?;
    Ok(())
}

/// Parses capture group `index`. The patterns bound every numeric group, so
/// this only fails on a group that did not participate.
fn group<T: FromStr>(captures: &Captures<'_>, index: usize) -> Option<T> {
    captures.get(index)?.as_str().parse().ok()
}

fn roll(state: &mut ServerState, source: Option<SessionId>, captures: &Captures<'_>) {
    let Some(id) = source else {
        state.reply(None, "the console cannot roll dice");
        return;
    };
    let (Some(dice), Some(sides)) = (group::<u32>(captures, 2), group::<u32>(captures, 3)) else {
        warn!("Roll arguments did not parse: {:?}", captures.get(0));
        return;
    };
    let modifier = group::<i64>(captures, 4).unwrap_or(0);

    if dice > MAX_DICE || sides > MAX_SIDES {
        state.reply(
            source,
            &format!(
                "please roll at most {} dice with at most {} sides",
                MAX_DICE, MAX_SIDES
            ),
        );
        return;
    }

    let rolls: Vec<u32> = (0..dice)
        .map(|_| state.rng().gen_range(1..=sides))
        .collect();
    let outcome = format_roll(sides, &rolls, modifier);

    if captures.get(1).is_some() {
        state.reply(source, &format!("Server: you rolled privately {}", outcome));
    } else {
        let name = state.username(id).unwrap_or("someone").to_string();
        state.broadcast(Message::chat(format!("Server: {} rolled {}", name, outcome)));
    }
}

/// Renders a roll such as `3d6+2: 1 + 4 + 2 + 2 = 9`.
pub fn format_roll(sides: u32, rolls: &[u32], modifier: i64) -> String {
    let offset = match modifier {
        0 => String::new(),
        m if m > 0 => format!("+{}", m),
        m => format!("-{}", m.unsigned_abs()),
    };

    let terms: Vec<String> = rolls.iter().map(u32::to_string).collect();
    let mut line = terms.join(" + ");
    if modifier > 0 {
        line.push_str(&format!(" + {}", modifier));
    } else if modifier < 0 {
        line.push_str(&format!(" - {}", modifier.unsigned_abs()));
    }

    let total: i64 = rolls.iter().map(|&r| i64::from(r)).sum::<i64>() + modifier;
    format!("{}d{}{}: {} = {}", rolls.len(), sides, offset, line, total)
}

fn setup(state: &mut ServerState, source: Option<SessionId>, captures: &Captures<'_>) {
    let (Some(x), Some(y)) = (group::<i32>(captures, 1), group::<i32>(captures, 2)) else {
        warn!("Setup arguments did not parse: {:?}", captures.get(0));
        return;
    };
    state.board.set_size(x, y);
    state.reply(source, &format!("Server: size set to {}, {}.", x, y));
}

fn add_unit(state: &mut ServerState, source: Option<SessionId>, captures: &Captures<'_>) {
    let name = &captures[1];
    let (Some(x), Some(y)) = (group::<i32>(captures, 2), group::<i32>(captures, 3)) else {
        warn!("Add arguments did not parse: {:?}", captures.get(0));
        return;
    };
    let (Some(r), Some(g), Some(b)) = (
        group::<u8>(captures, 4),
        group::<u8>(captures, 5),
        group::<u8>(captures, 6),
    ) else {
        state.reply(source, "unit colors must be between 0 and 255");
        return;
    };

    let Some(unit) = state.board.add_unit(name, x, y, Color::rgb(r, g, b)) else {
        state.reply(
            source,
            &format!(
                "({}, {}) is outside the {}x{} board",
                x, y, state.board.width, state.board.height
            ),
        );
        return;
    };

    state.broadcast(Message::NewUnit { unit });
    state.reply(
        source,
        &format!(
            "Server: added unit {} at {}, {} with color {} {} {}.",
            name, x, y, r, g, b
        ),
    );
}

fn stop(state: &mut ServerState, source: Option<SessionId>, _captures: &Captures<'_>) {
    state.reply(source, "Server: stopping.");
    state.request_shutdown();
}
