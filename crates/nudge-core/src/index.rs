//! Per-day cache over the canonical todo list.
//!
//! The index holds nothing that cannot be derived from the list it was built
//! from. Only [`crate::store::TodoStore`] mutates it, inside the same
//! operation that mutates the list.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::trace;

use crate::todo::Todo;

/// Todos due on one day, split by completion and sorted by priority.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayBucket {
    pub incomplete: Vec<Todo>,
    pub completed: Vec<Todo>,
}

impl DayBucket {
    pub fn is_empty(&self) -> bool {
        self.incomplete.is_empty() && self.completed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.incomplete.len() + self.completed.len()
    }

    /// Incomplete todos first, then completed ones.
    pub fn iter(&self) -> impl Iterator<Item = &Todo> {
        self.incomplete.iter().chain(self.completed.iter())
    }

    pub fn max_priority(&self) -> u32 {
        self.iter().map(|t| t.priority).max().unwrap_or(0)
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.len();
        self.incomplete.retain(|t| t.id != id);
        self.completed.retain(|t| t.id != id);
        before != self.len()
    }

    fn insert_sorted(&mut self, todo: Todo) {
        let list = if todo.done {
            &mut self.completed
        } else {
            &mut self.incomplete
        };
        list.push(todo);
        list.sort_by_key(|t| t.priority);
    }
}

#[derive(Debug, Clone, Default)]
pub struct DateIndex {
    buckets: BTreeMap<NaiveDate, DayBucket>,
}

impl DateIndex {
    pub fn build(todos: &[Todo], tz: &Tz) -> Self {
        let mut index = Self::default();
        for todo in todos {
            index.upsert(todo.clone(), tz);
        }
        trace!(days = index.buckets.len(), todos = todos.len(), "built date index");
        index
    }

    pub fn bucket(&self, day: NaiveDate) -> Option<&DayBucket> {
        self.buckets.get(&day)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.buckets.keys().copied()
    }

    pub fn day_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Places `todo` in its day's bucket, replacing any entry with the same id
    /// in that bucket.
    pub(crate) fn upsert(&mut self, todo: Todo, tz: &Tz) {
        let bucket = self.buckets.entry(todo.day(tz)).or_default();
        bucket.remove(&todo.id);
        bucket.insert_sorted(todo);
    }

    /// Drops `id` from the bucket for `day`; the bucket itself goes away once
    /// it is empty.
    pub(crate) fn remove(&mut self, id: &str, day: NaiveDate) -> bool {
        let Some(bucket) = self.buckets.get_mut(&day) else {
            return false;
        };
        let removed = bucket.remove(id);
        if bucket.is_empty() {
            self.buckets.remove(&day);
            trace!(%day, "pruned empty day bucket");
        }
        removed
    }
}
