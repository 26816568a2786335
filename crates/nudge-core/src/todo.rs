use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::datetime::{day_key, derive_date_tag, start_of_day};

/// Coarse day label stored alongside each record, relative to the last
/// renormalization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DateTag {
    Today,
    Tomorrow,
    Future,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub done: bool,

    /// Always the start of a calendar day.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub due_date: DateTime<Utc>,

    /// 1-based rank among todos sharing `due_date`.
    pub priority: u32,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    pub date: DateTag,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Todo {
    pub fn new(
        title: String,
        due_date: DateTime<Utc>,
        priority: u32,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> Self {
        let due_date = start_of_day(due_date, tz);
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            done: false,
            due_date,
            priority,
            created_at: now,
            date: derive_date_tag(due_date, now, tz),
            extra: BTreeMap::new(),
        }
    }

    pub fn day(&self, tz: &Tz) -> NaiveDate {
        day_key(self.due_date, tz)
    }
}

/// Field changes for an update. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TodoPatch {
    pub title: Option<String>,
    pub done: Option<bool>,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Option<u32>,
}

impl TodoPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.done.is_none()
            && self.due_date.is_none()
            && self.priority.is_none()
    }

    pub(crate) fn apply(self, todo: &mut Todo, tz: &Tz) {
        if let Some(title) = self.title {
            todo.title = title;
        }
        if let Some(done) = self.done {
            todo.done = done;
        }
        if let Some(due) = self.due_date {
            todo.due_date = start_of_day(due, tz);
        }
        if let Some(priority) = self.priority {
            todo.priority = priority;
        }
    }
}

/// Loose shape of a persisted record. Every field may be missing or of the
/// wrong type in data written by older builds.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTodo {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    title: Option<Value>,
    #[serde(default)]
    done: Option<Value>,
    #[serde(default)]
    due_date: Option<Value>,
    #[serde(default)]
    priority: Option<Value>,
    #[serde(default)]
    created_at: Option<Value>,
    #[serde(default)]
    date: Option<Value>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Parses the persisted todo blob, repairing records instead of dropping
/// them. Only entries that are not JSON objects are skipped.
#[tracing::instrument(skip(raw, now, tz), fields(bytes = raw.len()))]
pub fn repair_records(raw: &str, now: DateTime<Utc>, tz: &Tz) -> anyhow::Result<Vec<Todo>> {
    let values: Vec<Value> =
        serde_json::from_str(raw).context("persisted todos are not a JSON array")?;

    let mut out = Vec::with_capacity(values.len());
    for (idx, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<StoredTodo>(value) {
            Ok(stored) => out.push(repair_record(stored, now, tz)),
            Err(err) => warn!(index = idx, error = %err, "skipping unreadable todo record"),
        }
    }

    debug!(count = out.len(), "repaired persisted todos");
    Ok(out)
}

fn repair_record(stored: StoredTodo, now: DateTime<Utc>, tz: &Tz) -> Todo {
    let id = match stored.id {
        Some(Value::String(id)) if !id.is_empty() => id,
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            let fresh = Uuid::new_v4().to_string();
            warn!(id = %fresh, "todo record had no id; assigned a new one");
            fresh
        }
    };

    let title = match stored.title {
        Some(Value::String(title)) => title,
        _ => {
            warn!(id = %id, "todo record had no title");
            String::new()
        }
    };

    let done = stored.done.and_then(|v| v.as_bool()).unwrap_or(false);

    let due_date = match stored.due_date.as_ref().and_then(millis) {
        Some(due) => start_of_day(due, tz),
        None => {
            let legacy = stored.date.as_ref().and_then(|v| v.as_str());
            debug!(id = %id, legacy_tag = ?legacy, "deriving due date from legacy tag");
            legacy_due_date(legacy, now, tz)
        }
    };

    let priority = stored
        .priority
        .as_ref()
        .and_then(|v| v.as_u64())
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(0);

    let created_at = stored
        .created_at
        .as_ref()
        .and_then(millis)
        .unwrap_or(due_date);

    Todo {
        id,
        title,
        done,
        due_date,
        priority,
        created_at,
        date: derive_date_tag(due_date, now, tz),
        extra: stored.extra,
    }
}

fn legacy_due_date(tag: Option<&str>, now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    match tag {
        Some("tomorrow") => start_of_day(now + Duration::days(1), tz),
        _ => start_of_day(now, tz),
    }
}

/// Epoch milliseconds as written by the app. Zero counts as unset.
fn millis(value: &Value) -> Option<DateTime<Utc>> {
    let ms = value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| f as i64)
    })?;
    if ms == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(ms)
}
