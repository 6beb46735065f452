//! Plan buckets and flattened step views
//!
//! Steps are stored on the plan row in whatever shape the instance wrote
//! them. [`derive_steps`] turns them into a de-duplicated, ordered list of
//! [`PlanStep`]s; when a plan has no usable steps the plan itself stands in as
//! a single step.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::normalize::row_id;
use crate::types::{InstancePlan, PlanStatus, PlanStep, StepStatus};

/// Plans grouped for display
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanBuckets {
    /// In progress. Normally at most one.
    pub active: Vec<InstancePlan>,
    /// Pending, paused or blocked
    pub upcoming: Vec<InstancePlan>,
    /// Completed, failed or cancelled
    pub finished: Vec<InstancePlan>,
    /// Conflicts found while grouping
    pub warnings: Vec<String>,
}

/// Group plans by status, keeping input order within each bucket.
///
/// More than one in-progress plan is tolerated: all of them land in
/// `active` and a warning is recorded.
pub fn categorize_plans(plans: &[InstancePlan]) -> PlanBuckets {
    let mut buckets = PlanBuckets::default();
    for plan in plans {
        match plan.status {
            PlanStatus::InProgress => buckets.active.push(plan.clone()),
            PlanStatus::Pending | PlanStatus::Paused | PlanStatus::Blocked => {
                buckets.upcoming.push(plan.clone())
            }
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled => {
                buckets.finished.push(plan.clone())
            }
        }
    }

    if buckets.active.len() > 1 {
        let ids: Vec<&str> = buckets.active.iter().map(|p| p.id.as_str()).collect();
        buckets.warnings.push(format!(
            "{} plans are in progress at once: {}",
            ids.len(),
            ids.join(", ")
        ));
    }
    buckets
}

/// Log every status conflict in `plans`. Returns the warnings.
pub fn warn_on_conflicts(plans: &[InstancePlan]) -> Vec<String> {
    let warnings = categorize_plans(plans).warnings;
    for warning in &warnings {
        tracing::warn!(warning = %warning, "Conflicting plan states");
    }
    warnings
}

/// Flatten the steps of every plan, in plan order.
pub fn derive_all_steps(plans: &[InstancePlan]) -> Vec<PlanStep> {
    plans.iter().flat_map(derive_steps).collect()
}

/// Flatten one plan's raw steps.
pub fn derive_steps(plan: &InstancePlan) -> Vec<PlanStep> {
    let raw = match &plan.steps {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) | None => return vec![synthetic_step(plan)],
        Some(other) => {
            tracing::warn!(
                plan_id = %plan.id,
                shape = json_kind(other),
                "Plan steps are not a list, using the plan as a single step"
            );
            return vec![synthetic_step(plan)];
        }
    };

    let steps: Vec<PlanStep> = raw
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match item.as_object() {
            Some(obj) => Some(step_from_object(plan, index, item, obj)),
            None => {
                tracing::warn!(plan_id = %plan.id, index, "Skipping malformed plan step");
                None
            }
        })
        .collect();

    if steps.is_empty() {
        return vec![synthetic_step(plan)];
    }
    dedupe_steps(steps)
}

/// Drop steps whose id was already seen (first wins) and sort by order.
///
/// The sort is stable and the output has no duplicates, so running this
/// again returns the same list.
pub fn dedupe_steps(steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut seen = HashSet::new();
    let mut unique: Vec<PlanStep> = Vec::with_capacity(steps.len());
    for step in steps {
        if seen.contains(&step.id) {
            tracing::warn!(step_id = %step.id, plan_id = %step.plan_id, "Dropping duplicate plan step");
            continue;
        }
        seen.insert(step.id.clone());
        unique.push(step);
    }
    unique.sort_by_key(|s| s.order);
    unique
}

/// The id a raw step is known by in the derived list
pub fn raw_step_id(plan_id: &str, index: usize, raw: &Value) -> String {
    row_id(raw)
        .or_else(|| string_or_number(raw, "step_id"))
        .unwrap_or_else(|| format!("{}-step-{}", plan_id, index))
}

/// Return the plan's raw steps with `step_id` removed.
pub fn remove_step(plan: &InstancePlan, step_id: &str) -> Result<Value> {
    let mut items = raw_steps(plan, step_id)?;
    let index = find_raw_step(&plan.id, &items, step_id)?;
    items.remove(index);
    Ok(Value::Array(items))
}

/// Return the plan's raw steps with `step_id` retitled.
pub fn edit_step(
    plan: &InstancePlan,
    step_id: &str,
    title: &str,
    description: Option<&str>,
) -> Result<Value> {
    let mut items = raw_steps(plan, step_id)?;
    let index = find_raw_step(&plan.id, &items, step_id)?;
    let Some(obj) = items[index].as_object_mut() else {
        return Err(Error::StepNotFound(step_id.to_string()));
    };
    obj.insert("title".to_string(), Value::String(title.to_string()));
    match description {
        Some(description) => {
            obj.insert(
                "description".to_string(),
                Value::String(description.to_string()),
            );
        }
        None => {
            obj.remove("description");
        }
    }
    Ok(Value::Array(items))
}

fn raw_steps(plan: &InstancePlan, step_id: &str) -> Result<Vec<Value>> {
    match &plan.steps {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Err(Error::StepNotFound(step_id.to_string())),
    }
}

fn find_raw_step(plan_id: &str, items: &[Value], step_id: &str) -> Result<usize> {
    items
        .iter()
        .enumerate()
        .position(|(index, raw)| raw.is_object() && raw_step_id(plan_id, index, raw) == step_id)
        .ok_or_else(|| Error::StepNotFound(step_id.to_string()))
}

fn step_from_object(
    plan: &InstancePlan,
    index: usize,
    raw: &Value,
    obj: &Map<String, Value>,
) -> PlanStep {
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };

    // A step with only a description uses it as the title.
    let (title, description) = match (text(&["title", "name"]), text(&["description", "details"])) {
        (Some(title), description) => (title, description),
        (None, Some(description)) => (description, None),
        (None, None) => (format!("Step {}", index + 1), None),
    };

    let status = match obj.get("status").and_then(Value::as_str) {
        Some(status) => StepStatus::parse(status),
        None if obj.get("completed").and_then(Value::as_bool) == Some(true) => {
            StepStatus::Completed
        }
        None => StepStatus::Pending,
    };

    let order = ["order", "index", "position"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_i64))
        .unwrap_or(index as i64);

    PlanStep {
        id: raw_step_id(&plan.id, index, raw),
        title,
        description,
        status,
        order,
        plan_id: plan.id.clone(),
    }
}

fn synthetic_step(plan: &InstancePlan) -> PlanStep {
    PlanStep {
        id: plan.id.clone(),
        title: plan.title.clone(),
        description: plan.description.clone(),
        status: StepStatus::from(plan.status),
        order: 0,
        plan_id: plan.id.clone(),
    }
}

fn string_or_number(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
