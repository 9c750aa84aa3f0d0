//! Field-level change tracking between flushes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Grimoire, OverlayPosition, Script, Seat};

/// The diffed fields of the grimoire state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Script,
    Page,
    Seats,
    Grim,
    Overlay,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Script => "script",
            Field::Page => "page",
            Field::Seats => "seats",
            Field::Grim => "grim",
            Field::Overlay => "overlay",
        };
        f.write_str(name)
    }
}

/// One field write. `None` means the field became absent.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Script(Option<Script>),
    Page(Option<String>),
    Seats(Option<Vec<Seat>>),
    Grim(Option<Grimoire>),
    Overlay(Option<OverlayPosition>),
}

impl FieldUpdate {
    pub fn field(&self) -> Field {
        match self {
            FieldUpdate::Script(_) => Field::Script,
            FieldUpdate::Page(_) => Field::Page,
            FieldUpdate::Seats(_) => Field::Seats,
            FieldUpdate::Grim(_) => Field::Grim,
            FieldUpdate::Overlay(_) => Field::Overlay,
        }
    }
}

/// Latest value of every field touched since the last flush.
///
/// A field set and then cleared within one batch has no entry at all, so
/// viewers never see a transient absence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Script>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seats: Option<Vec<Seat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grim: Option<Grimoire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayPosition>,
}

impl StateDiff {
    /// Record a write, replacing (or removing) the field's entry.
    pub fn apply(&mut self, update: FieldUpdate) {
        match update {
            FieldUpdate::Script(v) => self.script = v,
            FieldUpdate::Page(v) => self.page = v,
            FieldUpdate::Seats(v) => self.seats = v,
            FieldUpdate::Grim(v) => self.grim = v,
            FieldUpdate::Overlay(v) => self.overlay = v,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Fields that currently have an entry.
    pub fn fields(&self) -> Vec<Field> {
        let present = [
            (Field::Script, self.script.is_some()),
            (Field::Page, self.page.is_some()),
            (Field::Seats, self.seats.is_some()),
            (Field::Grim, self.grim.is_some()),
            (Field::Overlay, self.overlay.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(field, set)| set.then_some(field))
            .collect()
    }
}

/// Pending changes awaiting the next flush.
#[derive(Debug, Default)]
pub struct DiffAccumulator {
    pending: StateDiff,
}

impl DiffAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, update: FieldUpdate) {
        log::trace!("Accumulating change to {}", update.field());
        self.pending.apply(update);
    }

    /// Swap the pending diff for an empty one and return it.
    pub fn take(&mut self) -> StateDiff {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> &StateDiff {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
