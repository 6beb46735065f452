//! Plain-text rendering of session snapshots for the terminal.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use robotline_core::format::{format_relative_time_at, truncate_chars};
use robotline_core::session::{Notice, PlanBuckets, SessionSnapshot, TimelineItem, ToolCallGroup};
use robotline_core::{EntryKind, InstancePlan, PlanStep, TimelineEntry};

const PREVIEW_CHARS: usize = 80;
const TOOL_PREVIEW_CHARS: usize = 60;

/// Bracketed label for a timeline entry kind.
pub fn kind_label(kind: &EntryKind) -> &'static str {
    match kind {
        EntryKind::UserAction => "[you]",
        EntryKind::AgentAction => "[robot]",
        EntryKind::ToolCall | EntryKind::ToolResult => "[tool]",
        EntryKind::SystemMessage => "[system]",
        EntryKind::Error => "[error]",
        EntryKind::CompletedPlan => "[plan]",
        EntryKind::Unrecognized(_) => "[log]",
    }
}

/// One line for a timeline entry.
pub fn entry_line(entry: &TimelineEntry, now: DateTime<Utc>) -> String {
    let when = format_relative_time_at(entry.created_at, now);
    let body = if let Some(tool) = entry.tool_name() {
        let status = if entry.is_failure() { " (failed)" } else { "" };
        format!(
            "{}: {}{}",
            tool,
            truncate_chars(&entry.message, TOOL_PREVIEW_CHARS),
            status
        )
    } else if entry.collapsed {
        format!(
            "{} (+{} chars)",
            truncate_chars(&entry.message, PREVIEW_CHARS),
            entry.message.chars().count().saturating_sub(PREVIEW_CHARS)
        )
    } else {
        entry.message.clone()
    };
    format!("{:>8} {:<8} {}", when, kind_label(&entry.kind), body)
}

/// Summary line for a run of consecutive calls to one tool.
pub fn group_line(group: &ToolCallGroup, entries: &[TimelineEntry], now: DateTime<Utc>) -> String {
    let when = entries
        .get(group.indices.end.saturating_sub(1))
        .map(|e| format_relative_time_at(e.created_at, now))
        .unwrap_or_default();
    let failures = if group.has_failures() {
        format!(", {} failed", group.failure_count)
    } else {
        String::new()
    };
    format!(
        "{:>8} {:<8} {} x{}{}",
        when,
        "[tool]",
        group.tool_name,
        group.len(),
        failures
    )
}

/// Full history with tool-call runs folded into one line each.
pub fn history_lines(snapshot: &SessionSnapshot, now: DateTime<Utc>) -> Vec<String> {
    snapshot
        .items
        .iter()
        .filter_map(|item| match item {
            TimelineItem::Entry(index) => snapshot
                .timeline
                .get(*index)
                .map(|entry| entry_line(entry, now)),
            TimelineItem::Group(group) => Some(group_line(group, &snapshot.timeline, now)),
        })
        .collect()
}

pub fn notice_line(notice: &Notice) -> String {
    format!("{}: {}", notice.level.as_str(), notice.message)
}

fn plan_line(plan: &InstancePlan) -> String {
    format!(
        "  {} {} [{}] {}%",
        plan.id,
        plan.title,
        plan.status.as_str(),
        plan.progress_percentage
    )
}

fn step_line(step: &PlanStep, collapsed: &HashSet<String>) -> String {
    let marker = if collapsed.contains(&step.id) { "+" } else { "-" };
    let mut line = format!(
        "      {} {} {} [{}]",
        marker,
        step.id,
        step.title,
        step.status.as_str()
    );
    if let Some(description) = step.description.as_deref() {
        if !collapsed.contains(&step.id) {
            line.push_str(&format!("\n          {}", description));
        }
    }
    line
}

/// Plans grouped by bucket with their steps underneath.
pub fn plan_lines(
    buckets: &PlanBuckets,
    steps: &[PlanStep],
    collapsed: &HashSet<String>,
) -> Vec<String> {
    let mut lines = Vec::new();
    for (heading, plans) in [
        ("Active", &buckets.active),
        ("Upcoming", &buckets.upcoming),
        ("Finished", &buckets.finished),
    ] {
        if plans.is_empty() {
            continue;
        }
        lines.push(format!("{}:", heading));
        for plan in plans {
            lines.push(plan_line(plan));
            lines.extend(
                steps
                    .iter()
                    .filter(|s| s.plan_id == plan.id)
                    .map(|s| step_line(s, collapsed)),
            );
        }
    }
    for warning in &buckets.warnings {
        lines.push(format!("warning: {}", warning));
    }
    lines
}

/// Prints timeline entries as they appear, each once.
#[derive(Debug, Default)]
pub struct TimelinePrinter {
    printed: HashSet<String>,
}

impl TimelinePrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark everything in `snapshot` as already shown.
    pub fn mark_seen(&mut self, snapshot: &SessionSnapshot) {
        self.printed
            .extend(snapshot.timeline.iter().map(|e| e.id.clone()));
    }

    /// Lines for confirmed entries not printed yet.
    pub fn new_lines(&mut self, snapshot: &SessionSnapshot, now: DateTime<Utc>) -> Vec<String> {
        snapshot
            .timeline
            .iter()
            .filter(|e| !e.temporary)
            .filter(|e| self.printed.insert(e.id.clone()))
            .map(|e| entry_line(e, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robotline_core::session::NoticeLevel;
    use robotline_core::{InstanceIdentity, PlanStatus, PlanType, StepStatus, ToolPayload};
    use serde_json::json;

    fn entry(id: &str, kind: EntryKind, message: &str) -> TimelineEntry {
        TimelineEntry {
            id: id.to_string(),
            kind,
            created_at: Utc::now(),
            message: message.to_string(),
            details: None,
            user_id: None,
            tool: None,
            temporary: false,
            collapsed: false,
        }
    }

    fn snapshot(timeline: Vec<TimelineEntry>) -> SessionSnapshot {
        SessionSnapshot {
            identity: InstanceIdentity::assigned("abc"),
            items: robotline_core::session::group_tool_calls(&timeline),
            timeline,
            plans: Vec::new(),
            buckets: PlanBuckets::default(),
            steps: Vec::new(),
            collapsed_steps: HashSet::new(),
            thinking: false,
            bootstrapping: false,
            loading: false,
            sending: false,
            starting: false,
            unconfirmed: 0,
        }
    }

    #[test]
    fn test_entry_line_labels_and_previews() {
        let now = Utc::now();
        let line = entry_line(&entry("1", EntryKind::AgentAction, "Opening page"), now);
        assert!(line.contains("[robot]"));
        assert!(line.ends_with("Opening page"));

        let mut long = entry("2", EntryKind::SystemMessage, &"x".repeat(100));
        long.collapsed = true;
        let line = entry_line(&long, now);
        assert!(line.contains("... (+20 chars)"));
    }

    #[test]
    fn test_tool_entries_show_name_and_failure() {
        let mut call = entry("1", EntryKind::ToolCall, "Clicking submit");
        call.tool = Some(ToolPayload {
            name: "click".to_string(),
            result: Some(json!({"success": false})),
            screenshot: None,
        });
        let line = entry_line(&call, Utc::now());
        assert!(line.contains("click: Clicking submit (failed)"));
    }

    #[test]
    fn test_history_folds_tool_runs() {
        let mut timeline = vec![entry("0", EntryKind::AgentAction, "Starting")];
        for id in ["1", "2", "3"] {
            let mut call = entry(id, EntryKind::ToolCall, "Clicking");
            call.tool = Some(ToolPayload {
                name: "click".to_string(),
                result: None,
                screenshot: None,
            });
            timeline.push(call);
        }

        let lines = history_lines(&snapshot(timeline), Utc::now());
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("click x3"));
    }

    #[test]
    fn test_printer_skips_temporary_and_repeats() {
        let mut temp = entry("temp-1", EntryKind::UserAction, "hello");
        temp.temporary = true;
        let mut printer = TimelinePrinter::new();

        let first = snapshot(vec![temp, entry("L1", EntryKind::AgentAction, "Hi there")]);
        assert_eq!(printer.new_lines(&first, Utc::now()).len(), 1);
        assert!(printer.new_lines(&first, Utc::now()).is_empty());

        let second = snapshot(vec![
            entry("L0", EntryKind::UserAction, "hello"),
            entry("L1", EntryKind::AgentAction, "Hi there"),
        ]);
        let lines = printer.new_lines(&second, Utc::now());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[you]"));
    }

    #[test]
    fn test_plan_lines_group_by_bucket() {
        let plan = InstancePlan {
            id: "p1".to_string(),
            title: "Audit".to_string(),
            description: None,
            plan_type: PlanType::Task,
            status: PlanStatus::InProgress,
            progress_percentage: 50,
            steps_total: 2,
            steps_completed: 1,
            priority: 0,
            created_at: Utc::now(),
            updated_at: None,
            steps: None,
        };
        let buckets = PlanBuckets {
            active: vec![plan],
            ..Default::default()
        };
        let steps = vec![PlanStep {
            id: "s1".to_string(),
            title: "Open page".to_string(),
            description: Some("Use the staging site".to_string()),
            status: StepStatus::Completed,
            order: 0,
            plan_id: "p1".to_string(),
        }];

        let lines = plan_lines(&buckets, &steps, &HashSet::new());
        assert_eq!(lines[0], "Active:");
        assert!(lines[1].contains("Audit [in_progress] 50%"));
        assert!(lines[2].contains("Use the staging site"));

        let collapsed: HashSet<String> = ["s1".to_string()].into_iter().collect();
        let lines = plan_lines(&buckets, &steps, &collapsed);
        assert!(!lines[2].contains("staging"));
    }

    #[test]
    fn test_notice_line() {
        let notice = Notice {
            level: NoticeLevel::Error,
            message: "boom".to_string(),
        };
        assert_eq!(notice_line(&notice), "error: boom");
    }
}
