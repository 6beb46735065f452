//! Normalization of raw backend rows
//!
//! The backend has stored the same logical payload under several shapes over
//! time (`tool_name` vs `toolName`, `tool_result` vs `tool_results`, details
//! as an object or as a JSON string). Every row passes through this module
//! before the rest of the crate sees it, so downstream code only deals with
//! [`TimelineEntry`], [`InstancePlan`] and [`InstanceRecord`].
//!
//! Unknown entry kinds become [`EntryKind::Unrecognized`]; only a missing id
//! is treated as an error.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::{
    EntryKind, InstancePlan, InstanceRecord, InstanceStatus, PlanStatus, PlanType, TimelineEntry,
    ToolPayload,
};

/// Extract the id of a raw row (string or number).
pub fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map one raw log row to a timeline entry.
pub fn timeline_entry(row: &Value) -> Result<TimelineEntry> {
    let obj = row
        .as_object()
        .ok_or_else(|| Error::payload("log", "row is not an object"))?;
    let id = row_id(row).ok_or_else(|| Error::payload("log", "row has no id"))?;

    let details = obj.get("details").and_then(as_object_lenient);

    let kind = first_str(obj, &["log_type", "type", "kind"])
        .map(EntryKind::parse)
        .unwrap_or_else(|| EntryKind::Unrecognized(String::new()));

    let message = first_str(obj, &["message", "content", "text"])
        .unwrap_or_default()
        .to_string();

    let tool = tool_payload(obj, details.as_ref());

    let user_id = first_str(obj, &["user_id", "userId"]).map(str::to_string);

    Ok(TimelineEntry {
        id,
        kind,
        created_at: timestamp_or_now(obj.get("created_at")),
        message,
        details,
        user_id,
        tool,
        temporary: false,
        collapsed: false,
    })
}

/// Map a page of raw log rows, skipping malformed rows, oldest first.
pub fn timeline_entries(rows: &[Value]) -> Vec<TimelineEntry> {
    let mut entries: Vec<TimelineEntry> = rows
        .iter()
        .filter_map(|row| match timeline_entry(row) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed log row");
                None
            }
        })
        .collect();
    entries.sort_by_key(|e| e.created_at);
    entries
}

/// Map one raw plan row.
pub fn instance_plan(row: &Value) -> Result<InstancePlan> {
    let obj = row
        .as_object()
        .ok_or_else(|| Error::payload("plan", "row is not an object"))?;
    let id = row_id(row).ok_or_else(|| Error::payload("plan", "row has no id"))?;

    let status = match first_str(obj, &["status"]) {
        Some(raw) => raw.parse::<PlanStatus>().unwrap_or_else(|e| {
            tracing::warn!(plan_id = %id, error = %e, "Unknown plan status, treating as pending");
            PlanStatus::Pending
        }),
        None => PlanStatus::Pending,
    };

    let plan_type = first_str(obj, &["plan_type", "type"])
        .and_then(|raw| raw.parse::<PlanType>().ok())
        .unwrap_or(PlanType::Task);

    let progress = first_f64(obj, &["progress_percentage", "progress"])
        .unwrap_or(0.0)
        .clamp(0.0, 100.0)
        .round() as u8;

    let steps = match obj.get("steps") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(plan_id = %id, error = %e, "Unparseable plan steps");
                None
            }
        },
        Some(other) => Some(other.clone()),
    };

    Ok(InstancePlan {
        title: first_str(obj, &["title", "name"])
            .unwrap_or("Untitled plan")
            .to_string(),
        description: first_str(obj, &["description"]).map(str::to_string),
        plan_type,
        status,
        progress_percentage: progress,
        steps_total: first_f64(obj, &["steps_total", "total_steps"]).unwrap_or(0.0) as u32,
        steps_completed: first_f64(obj, &["steps_completed", "completed_steps"]).unwrap_or(0.0)
            as u32,
        priority: first_f64(obj, &["priority"]).unwrap_or(0.0) as i32,
        created_at: timestamp_or_now(obj.get("created_at")),
        updated_at: obj.get("updated_at").and_then(parse_timestamp),
        steps,
        id,
    })
}

/// Map a list of raw plan rows, skipping malformed rows.
pub fn instance_plans(rows: &[Value]) -> Vec<InstancePlan> {
    rows.iter()
        .filter_map(|row| match instance_plan(row) {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed plan row");
                None
            }
        })
        .collect()
}

/// Map a raw instance row from the directory.
pub fn instance_record(row: &Value) -> Result<InstanceRecord> {
    let obj = row
        .as_object()
        .ok_or_else(|| Error::payload("instance", "row is not an object"))?;
    let id = row_id(row).ok_or_else(|| Error::payload("instance", "row has no id"))?;
    Ok(InstanceRecord {
        id,
        name: first_str(obj, &["name"]).map(str::to_string),
        status: InstanceStatus::parse(first_str(obj, &["status"]).unwrap_or("pending")),
        created_at: obj.get("created_at").and_then(parse_timestamp),
    })
}

/// Parse an ISO-8601 timestamp, also accepting the space-separated form
/// Postgres emits without a zone.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn timestamp_or_now(value: Option<&Value>) -> DateTime<Utc> {
    match value.and_then(parse_timestamp) {
        Some(ts) => ts,
        None => {
            tracing::debug!(raw = ?value, "Missing or unparseable timestamp, using now");
            Utc::now()
        }
    }
}

fn tool_payload(obj: &Map<String, Value>, details: Option<&Map<String, Value>>) -> Option<ToolPayload> {
    let name = first_str(obj, &["tool_name", "toolName"])
        .or_else(|| details.and_then(|d| first_str(d, &["tool_name", "toolName"])))?
        .to_string();

    let result = first_present(obj, &["tool_result", "tool_results"])
        .or_else(|| details.and_then(|d| first_present(d, &["tool_result", "tool_results"])))
        .map(decode_embedded_json);

    let screenshot = first_str(obj, &["screenshot", "screenshot_base64"])
        .or_else(|| details.and_then(|d| first_str(d, &["screenshot", "screenshot_base64"])))
        .map(str::to_string);

    Some(ToolPayload {
        name,
        result,
        screenshot,
    })
}

/// Tool results are sometimes stored as a JSON document inside a string.
fn decode_embedded_json(value: &Value) -> Value {
    if let Value::String(raw) = value {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            match serde_json::from_str(raw) {
                Ok(parsed) => return parsed,
                Err(e) => tracing::debug!(error = %e, "Tool result looks like JSON but does not parse"),
            }
        }
    }
    value.clone()
}

fn as_object_lenient(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => {
                tracing::debug!("Details string is not a JSON object, ignoring");
                None
            }
        },
        _ => None,
    }
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

fn first_f64(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}
