//! Optimistic message buffer
//!
//! A message typed into the console shows up in the timeline right away as a
//! temporary [`EntryKind::UserAction`] entry. When the backend echoes the
//! message back through the change feed, the authoritative entry takes the
//! temporary one's place instead of being appended next to it.

use chrono::Utc;

use super::timeline::Timeline;
use crate::types::{EntryKind, TimelineEntry};

/// Prefix that marks an id as locally generated
pub const TEMP_ID_PREFIX: &str = "temp-";

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Tracks optimistic entries that are waiting for confirmation.
#[derive(Debug, Default)]
pub struct OptimisticBuffer {
    outstanding: usize,
}

impl OptimisticBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a temporary user entry for `text` and return a copy of it.
    pub fn add(&mut self, timeline: &mut Timeline, text: &str, user_id: Option<&str>) -> TimelineEntry {
        let entry = TimelineEntry {
            id: format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4()),
            kind: EntryKind::UserAction,
            created_at: Utc::now(),
            message: text.to_string(),
            details: None,
            user_id: user_id.map(str::to_string),
            tool: None,
            temporary: true,
            collapsed: false,
        };
        timeline.push(entry.clone());
        self.outstanding += 1;
        tracing::debug!(id = %entry.id, "Added optimistic entry");
        entry
    }

    /// Put `authoritative` in place of the first temporary user entry with the
    /// same text.
    ///
    /// Returns the position it was spliced into, or hands the entry back when
    /// nothing matched or its id is already in `timeline`.
    pub fn reconcile(
        &mut self,
        timeline: &mut Timeline,
        authoritative: TimelineEntry,
    ) -> Result<usize, TimelineEntry> {
        if timeline.contains(&authoritative.id) {
            return Err(authoritative);
        }
        let position = timeline.iter().position(|e| {
            e.temporary && e.kind == authoritative.kind && e.message == authoritative.message
        });

        match position {
            Some(index) => {
                let replaced = timeline.replace_at(index, authoritative);
                self.outstanding = self.outstanding.saturating_sub(1);
                tracing::debug!(
                    temporary_id = %replaced.id,
                    index,
                    "Reconciled optimistic entry"
                );
                Ok(index)
            }
            None => Err(authoritative),
        }
    }

    /// Number of entries added but not yet reconciled
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Forget transient bookkeeping (the active instance changed).
    pub fn reset(&mut self) {
        self.outstanding = 0;
    }

    /// Remove leftover temporary entries from `timeline`.
    pub fn purge(&mut self, timeline: &mut Timeline) -> usize {
        let removed = timeline.remove_where(|e| e.temporary);
        self.reset();
        removed
    }
}
