use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::trace;

use crate::datetime::derive_date_tag;
use crate::todo::Todo;

/// Re-packs priorities to `1..=n` within every due date and refreshes the
/// date tags against `now`.
///
/// Order inside a day is `(priority, created_at)`; the sort is stable so
/// records equal on both keep their relative order. The returned list is
/// ordered by `(due_date, priority)`.
pub fn renormalize(todos: Vec<Todo>, now: DateTime<Utc>, tz: &Tz) -> Vec<Todo> {
    let total = todos.len();
    let mut by_due: BTreeMap<DateTime<Utc>, Vec<Todo>> = BTreeMap::new();
    for todo in todos {
        by_due.entry(todo.due_date).or_default().push(todo);
    }

    let days = by_due.len();
    let mut out = Vec::with_capacity(total);
    for (due, mut list) in by_due {
        list.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        let tag = derive_date_tag(due, now, tz);
        for (position, mut todo) in list.into_iter().enumerate() {
            todo.priority = position as u32 + 1;
            todo.date = tag;
            out.push(todo);
        }
    }

    trace!(todos = total, days, "renormalized priorities");
    out
}

/// Moves the record with `id` behind every other record on its day.
pub(crate) fn send_to_tail(todos: &mut [Todo], id: &str) {
    let Some(due) = todos.iter().find(|t| t.id == id).map(|t| t.due_date) else {
        return;
    };
    let tail = todos
        .iter()
        .filter(|t| t.due_date == due && t.id != id)
        .map(|t| t.priority)
        .max()
        .unwrap_or(0);
    if let Some(todo) = todos.iter_mut().find(|t| t.id == id) {
        todo.priority = tail + 1;
    }
}
