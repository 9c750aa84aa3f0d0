//! The relay's view of the observed grimoire.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::diff::FieldUpdate;
use crate::model::{GamePhase, Grimoire, OverlayPosition, Script, Seat};

/// Current value of every field, plus the game phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub script: Option<Script>,
    pub page: Option<String>,
    pub seats: Option<Vec<Seat>>,
    pub grim: Option<Grimoire>,
    pub overlay: Option<OverlayPosition>,
    pub game: GamePhase,
}

/// Owns the snapshot and forwards every field write to the synchronizer.
#[derive(Debug)]
pub struct StateStore {
    snapshot: StateSnapshot,
    updates: mpsc::UnboundedSender<FieldUpdate>,
}

impl StateStore {
    pub fn new(updates: mpsc::UnboundedSender<FieldUpdate>) -> Self {
        Self {
            snapshot: StateSnapshot::default(),
            updates,
        }
    }

    /// Overwrite a field and notify, even if the value did not change.
    pub fn set_field(&mut self, update: FieldUpdate) {
        match &update {
            FieldUpdate::Script(v) => self.snapshot.script = v.clone(),
            FieldUpdate::Page(v) => self.snapshot.page = v.clone(),
            FieldUpdate::Seats(v) => self.snapshot.seats = v.clone(),
            FieldUpdate::Grim(v) => self.snapshot.grim = v.clone(),
            FieldUpdate::Overlay(v) => self.snapshot.overlay = *v,
        }
        if self.updates.send(update).is_err() {
            log::debug!("Synchronizer gone, field change not forwarded");
        }
    }

    /// Move the game phase. Not diffed, so nothing is forwarded.
    pub fn step_phase(&mut self, target: GamePhase) -> GamePhase {
        let next = self.snapshot.game.step(target);
        if next != self.snapshot.game {
            log::info!("Game phase {:?} -> {:?}", self.snapshot.game, next);
            self.snapshot.game = next;
        }
        next
    }

    pub fn phase(&self) -> GamePhase {
        self.snapshot.game
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }
}
