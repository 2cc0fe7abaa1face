use log::info;
use shared::{Color, Unit};
use std::collections::BTreeMap;

/// The shared board: its dimensions and every unit placed on it.
///
/// Only the dispatch loop mutates the board, so it carries no lock of its
/// own.
#[derive(Debug, Clone)]
pub struct Board {
    pub width: i32,
    pub height: i32,
    units: BTreeMap<i32, Unit>,
    next_uid: i32,
}

impl Board {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            units: BTreeMap::new(),
            next_uid: 0,
        }
    }

    pub fn set_size(&mut self, width: i32, height: i32) {
        info!("Board resized to {}x{}", width, height);
        self.width = width;
        self.height = height;
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        (0..self.width).contains(&x) && (0..self.height).contains(&y)
    }

    /// Places a new unit and returns it, or None if the position is off the
    /// board.
    pub fn add_unit(&mut self, name: &str, x: i32, y: i32, color: Color) -> Option<Unit> {
        if !self.contains(x, y) {
            return None;
        }

        let unit = Unit::new(self.next_uid, name, x, y, color);
        self.next_uid += 1;

        info!("Added unit {} ({}) at ({}, {})", unit.name, unit.uid, x, y);
        self.units.insert(unit.uid, unit.clone());
        Some(unit)
    }

    /// Moves a unit, returning where it came from. None if the unit is
    /// unknown or the target is off the board.
    pub fn move_unit(&mut self, uid: i32, to_x: i32, to_y: i32) -> Option<(i32, i32)> {
        if !self.contains(to_x, to_y) {
            return None;
        }

        let unit = self.units.get_mut(&uid)?;
        let from = (unit.x, unit.y);
        unit.x = to_x;
        unit.y = to_y;

        info!(
            "Unit {} moved from ({}, {}) to ({}, {})",
            unit.name, from.0, from.1, to_x, to_y
        );
        Some(from)
    }

    pub fn unit(&self, uid: i32) -> Option<&Unit> {
        self.units.get(&uid)
    }

    /// Units in creation order.
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}
