//! The todo store: canonical list, per-day index and debounced persistence.
//!
//! Every public mutation leaves the list and the index in agreement and, except
//! for [`TodoStore::delete_todo`], leaves priorities densely packed per day.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::datetime::{Clock, SystemClock, day_key, start_of_day};
use crate::index::{DateIndex, DayBucket};
use crate::persist::{Debouncer, Snapshot};
use crate::priority::{renormalize, send_to_tail};
use crate::storage::Storage;
use crate::todo::{Todo, TodoPatch, repair_records};

pub const TODOS_KEY: &str = "todos";
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(120);

#[derive(Debug)]
pub struct TodoSnapshot(Vec<Todo>);

impl Snapshot for TodoSnapshot {
    fn entries(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(vec![(TODOS_KEY.to_string(), serde_json::to_string(&self.0)?)])
    }
}

#[derive(Debug)]
pub struct TodoStore {
    todos: Vec<Todo>,
    index: DateIndex,
    version: u64,
    loaded: bool,
    tz: Tz,
    clock: Arc<dyn Clock>,
    storage: Arc<Storage>,
    persister: Debouncer<TodoSnapshot>,
}

impl TodoStore {
    pub fn new(storage: Arc<Storage>, tz: Tz) -> Self {
        Self {
            todos: Vec::new(),
            index: DateIndex::default(),
            version: 0,
            loaded: false,
            tz,
            clock: Arc::new(SystemClock),
            persister: Debouncer::new(Arc::clone(&storage), DEFAULT_PERSIST_DEBOUNCE),
            storage,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.persister.cancel();
        self.persister = Debouncer::new(Arc::clone(&self.storage), delay);
        self
    }

    pub fn timezone(&self) -> &Tz {
        &self.tz
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Monotonic counter bumped by every applied mutation. Consumers key their
    /// own derived caches on `(day, version)`.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// False until [`TodoStore::load`] has completed.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Reads the persisted collection, repairing legacy records.
    ///
    /// Storage problems are logged and leave the store empty; they are never
    /// returned to the caller.
    #[instrument(skip(self), fields(namespace = %self.storage.namespace()))]
    pub async fn load(&mut self) {
        self.storage.ensure_initialized().await;

        let Some(raw) = self.storage.get_string(TODOS_KEY) else {
            info!("no persisted todos");
            self.loaded = true;
            return;
        };

        match repair_records(&raw, self.now(), &self.tz) {
            Ok(todos) => {
                self.todos = ensure_unique_ids(todos);
                self.renormalize_and_rebuild();
                self.version += 1;
                info!(count = self.todos.len(), days = self.index.day_count(), "loaded todos");
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to load todos; starting empty");
            }
        }
        self.loaded = true;
    }

    /// Appends a todo at the end of its day. `due` defaults to today.
    ///
    /// The title is taken as given; rejecting blank titles is up to the
    /// caller.
    #[instrument(skip(self, title))]
    pub fn add_todo(&mut self, title: impl Into<String>, due: Option<DateTime<Utc>>) -> Todo {
        let now = self.now();
        let due = start_of_day(due.unwrap_or(now), &self.tz);
        let day = day_key(due, &self.tz);
        let priority = self
            .index
            .bucket(day)
            .map(DayBucket::max_priority)
            .unwrap_or(0)
            + 1;

        let todo = Todo::new(title.into(), due, priority, now, &self.tz);
        self.todos.push(todo.clone());
        self.index.upsert(todo.clone(), &self.tz);
        self.mutated();

        info!(id = %todo.id, %day, priority, "added todo");
        todo
    }

    /// Applies `patch` to the todo with `id`. Unknown ids are ignored.
    #[instrument(skip(self, patch))]
    pub fn update_todo(&mut self, id: &str, patch: TodoPatch) -> Option<Todo> {
        let Some(pos) = self.position(id) else {
            debug!("update for unknown todo ignored");
            return None;
        };

        patch.apply(&mut self.todos[pos], &self.tz);
        self.renormalize_and_rebuild();
        self.mutated();

        let updated = self.get(id).cloned();
        info!(version = self.version, "updated todo");
        updated
    }

    /// Removes the todo with `id`. Remaining priorities on that day are left
    /// as they are, so a gap may remain until the next renormalizing call.
    #[instrument(skip(self))]
    pub fn delete_todo(&mut self, id: &str) -> bool {
        let Some(pos) = self.position(id) else {
            debug!("delete for unknown todo ignored");
            return false;
        };

        let removed = self.todos.remove(pos);
        let day = removed.day(&self.tz);
        self.index.remove(&removed.id, day);
        self.mutated();

        info!(%day, "deleted todo");
        true
    }

    /// Flips completion. The todo moves to the tail of its day before
    /// priorities are re-packed.
    #[instrument(skip(self))]
    pub fn toggle_todo(&mut self, id: &str) -> Option<Todo> {
        let Some(pos) = self.position(id) else {
            debug!("toggle for unknown todo ignored");
            return None;
        };

        let done = !self.todos[pos].done;
        self.todos[pos].done = done;
        send_to_tail(&mut self.todos, id);
        self.renormalize_and_rebuild();
        self.mutated();

        let toggled = self.get(id).cloned();
        info!(done, "toggled todo");
        toggled
    }

    /// Reorders the incomplete todos of `date`'s day to follow `ordered_ids`.
    ///
    /// Ids that are not incomplete todos on that day are skipped. Incomplete
    /// todos missing from the list keep their previous order after the listed
    /// ones, and completed todos follow in their previous order. A list with
    /// no usable id changes nothing.
    #[instrument(skip(self, date, ordered_ids), fields(requested = ordered_ids.len()))]
    pub fn reorder_todos_for_date<S: AsRef<str>>(
        &mut self,
        date: DateTime<Utc>,
        ordered_ids: &[S],
    ) -> bool {
        if ordered_ids.is_empty() {
            warn!("empty order given; ignoring reorder");
            return false;
        }

        let day = day_key(date, &self.tz);
        let Some(bucket) = self.index.bucket(day) else {
            warn!(%day, "no todos on day; ignoring reorder");
            return false;
        };

        let incomplete: HashSet<&str> = bucket.incomplete.iter().map(|t| t.id.as_str()).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut sequence: Vec<String> = Vec::with_capacity(bucket.len());
        for id in ordered_ids {
            let id = id.as_ref();
            if let Some(known) = incomplete.get(id).copied()
                && seen.insert(known)
            {
                sequence.push(known.to_string());
            }
        }

        if sequence.is_empty() {
            warn!(%day, "order matched no incomplete todo; ignoring reorder");
            return false;
        }

        let listed = sequence.len();
        sequence.extend(
            bucket
                .incomplete
                .iter()
                .filter(|t| !seen.contains(t.id.as_str()))
                .map(|t| t.id.clone()),
        );
        sequence.extend(bucket.completed.iter().map(|t| t.id.clone()));

        let ranks: HashMap<String, u32> = sequence
            .into_iter()
            .enumerate()
            .map(|(pos, id)| (id, pos as u32 + 1))
            .collect();
        for todo in &mut self.todos {
            if let Some(rank) = ranks.get(&todo.id) {
                todo.priority = *rank;
            }
        }

        self.renormalize_and_rebuild();
        self.mutated();
        info!(%day, listed, "reordered day");
        true
    }

    /// Copy of the bucket for `date`'s day; empty when nothing is due.
    pub fn separated_todos_for_date(&self, date: DateTime<Utc>) -> DayBucket {
        self.bucket_for(date).cloned().unwrap_or_default()
    }

    /// Incomplete todos, then completed ones, for `date`'s day.
    pub fn todos_for_date(&self, date: DateTime<Utc>) -> Vec<Todo> {
        self.bucket_for(date)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Earliest incomplete todo across all days, by `(due_date, priority)`.
    pub fn next_incomplete_todo(&self) -> Option<Todo> {
        self.todos
            .iter()
            .filter(|t| !t.done)
            .min_by_key(|t| (t.due_date, t.priority))
            .cloned()
    }

    pub fn next_todo_for_date(&self, date: DateTime<Utc>) -> Option<Todo> {
        self.bucket_for(date)
            .and_then(|bucket| bucket.incomplete.first())
            .cloned()
    }

    pub fn get(&self, id: &str) -> Option<&Todo> {
        self.todos.iter().find(|t| t.id == id)
    }

    /// Finds a todo by full id or by an unambiguous id prefix.
    pub fn resolve_id(&self, prefix: &str) -> anyhow::Result<&Todo> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(anyhow!("todo id cannot be empty"));
        }
        if let Some(exact) = self.get(prefix) {
            return Ok(exact);
        }

        let mut matches = self.todos.iter().filter(|t| t.id.starts_with(prefix));
        let first = matches
            .next()
            .ok_or_else(|| anyhow!("no todo matches id {prefix}"))?;
        if matches.next().is_some() {
            return Err(anyhow!("id prefix {prefix} is ambiguous"));
        }
        Ok(first)
    }

    /// The canonical list, ordered by `(due_date, priority)` after any
    /// renormalizing call.
    pub fn all(&self) -> &[Todo] {
        &self.todos
    }

    pub fn len(&self) -> usize {
        self.todos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.todos.is_empty()
    }

    /// Days that currently have a bucket, ascending.
    pub fn days(&self) -> Vec<NaiveDate> {
        self.index.days().collect()
    }

    /// Rebuilds the index from the canonical list.
    pub fn rebuild_index(&mut self) {
        self.index = DateIndex::build(&self.todos, &self.tz);
        self.version += 1;
    }

    pub fn has_pending_write(&self) -> bool {
        self.persister.is_pending()
    }

    /// Writes any scheduled snapshot now.
    pub fn flush(&mut self) {
        self.persister.flush();
    }

    fn bucket_for(&self, date: DateTime<Utc>) -> Option<&DayBucket> {
        self.index.bucket(day_key(date, &self.tz))
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.todos.iter().position(|t| t.id == id)
    }

    fn renormalize_and_rebuild(&mut self) {
        let todos = std::mem::take(&mut self.todos);
        self.todos = renormalize(todos, self.now(), &self.tz);
        self.index = DateIndex::build(&self.todos, &self.tz);
    }

    fn mutated(&mut self) {
        self.version += 1;
        self.persister.schedule(TodoSnapshot(self.todos.clone()));
    }
}

fn ensure_unique_ids(mut todos: Vec<Todo>) -> Vec<Todo> {
    let mut seen = HashSet::new();
    for todo in &mut todos {
        if !seen.insert(todo.id.clone()) {
            let fresh = Uuid::new_v4().to_string();
            warn!(duplicate = %todo.id, id = %fresh, "duplicate todo id; assigned a new one");
            todo.id = fresh.clone();
            seen.insert(fresh);
        }
    }
    todos
}
