//! Ordered timeline storage for one instance.

use crate::types::TimelineEntry;

/// Entries in display order. Ids are unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<TimelineEntry>) -> Self {
        let mut timeline = Self::new();
        for entry in entries {
            if !timeline.push_unique(entry) {
                tracing::warn!("Dropping duplicate timeline entry while loading");
            }
        }
        timeline
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TimelineEntry> {
        self.entries.iter()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn push(&mut self, entry: TimelineEntry) {
        self.entries.push(entry);
    }

    /// Append unless an entry with the same id exists. Returns whether it was added.
    pub fn push_unique(&mut self, entry: TimelineEntry) -> bool {
        if self.contains(&entry.id) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Replace the entry at `index`, returning the old one.
    pub fn replace_at(&mut self, index: usize, entry: TimelineEntry) -> TimelineEntry {
        std::mem::replace(&mut self.entries[index], entry)
    }

    pub fn remove(&mut self, id: &str) -> Option<TimelineEntry> {
        let index = self.position(id)?;
        Some(self.entries.remove(index))
    }

    /// Remove every entry matching `predicate`, returning how many were removed.
    pub fn remove_where(&mut self, predicate: impl Fn(&TimelineEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !predicate(e));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn into_entries(self) -> Vec<TimelineEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;
    use chrono::Utc;

    fn entry(id: &str) -> TimelineEntry {
        TimelineEntry {
            id: id.to_string(),
            kind: EntryKind::SystemMessage,
            created_at: Utc::now(),
            message: String::new(),
            details: None,
            user_id: None,
            tool: None,
            temporary: false,
            collapsed: false,
        }
    }

    #[test]
    fn test_push_unique_rejects_duplicates() {
        let mut timeline = Timeline::new();
        assert!(timeline.push_unique(entry("a")));
        assert!(!timeline.push_unique(entry("a")));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_from_entries_dedupes() {
        let timeline = Timeline::from_entries(vec![entry("a"), entry("b"), entry("a")]);
        let ids: Vec<_> = timeline.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_remove_where() {
        let mut timeline = Timeline::from_entries(vec![entry("a"), entry("b"), entry("c")]);
        assert_eq!(timeline.remove_where(|e| e.id != "b"), 2);
        assert_eq!(timeline.position("b"), Some(0));
    }
}
