//! Grouping of consecutive tool calls for display.

use std::ops::Range;

use crate::types::TimelineEntry;

/// A run of consecutive entries that used the same tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallGroup {
    pub tool_name: String,
    /// Positions of the members in the timeline
    pub indices: Range<usize>,
    pub failure_count: usize,
}

impl ToolCallGroup {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count > 0
    }
}

/// One row of the rendered timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineItem {
    /// A single entry, by timeline position
    Entry(usize),
    Group(ToolCallGroup),
}

/// Collapse runs of two or more entries with the same tool name.
pub fn group_tool_calls(entries: &[TimelineEntry]) -> Vec<TimelineItem> {
    let mut items = Vec::new();
    let mut start = 0;

    while start < entries.len() {
        let Some(tool_name) = entries[start].tool_name() else {
            items.push(TimelineItem::Entry(start));
            start += 1;
            continue;
        };

        let end = entries[start..]
            .iter()
            .position(|e| e.tool_name() != Some(tool_name))
            .map_or(entries.len(), |offset| start + offset);

        if end - start >= 2 {
            items.push(TimelineItem::Group(ToolCallGroup {
                tool_name: tool_name.to_string(),
                indices: start..end,
                failure_count: entries[start..end].iter().filter(|e| e.is_failure()).count(),
            }));
        } else {
            items.push(TimelineItem::Entry(start));
        }
        start = end;
    }
    items
}
