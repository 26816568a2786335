use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::cli::{Command, SettingsAction};
use crate::config::{Config, KEY_MONITOR_COMMAND};
use crate::datetime::{day_key, parse_day_expr};
use crate::reminders::{
    AppMonitor, CommandDetector, Reminder, ReminderScheduler, UsageDetector,
    remind_on_foreground, schedule_time_based_reminder, trigger_app_detected_reminder,
};
use crate::render::Renderer;
use crate::settings::{Mode, SettingsStore, Theme};
use crate::store::TodoStore;
use crate::todo::TodoPatch;

/// Stores a command runs against.
#[derive(Debug)]
pub struct Session {
    pub todos: TodoStore,
    pub settings: SettingsStore,
}

impl Session {
    /// Writes whatever the stores still have scheduled.
    pub fn flush(&mut self) {
        self.todos.flush();
        self.settings.flush();
    }
}

/// Terminal stand-in for the notification service: prints what would be
/// scheduled.
struct ConsoleScheduler<'a> {
    renderer: &'a Renderer,
}

impl ReminderScheduler for ConsoleScheduler<'_> {
    fn cancel_all(&self) -> anyhow::Result<()> {
        debug!("cancelled scheduled reminders");
        Ok(())
    }

    fn schedule_recurring(&self, interval_minutes: u32, reminder: &Reminder) -> anyhow::Result<()> {
        self.renderer
            .print_reminder(reminder, &format!("every {interval_minutes} min"))
    }

    fn trigger_immediate(&self, reminder: &Reminder) -> anyhow::Result<()> {
        self.renderer.print_reminder(reminder, "now")
    }
}

#[instrument(skip(session, renderer, cfg))]
pub async fn dispatch(
    session: &mut Session,
    renderer: &Renderer,
    cfg: &Config,
    command: Option<Command>,
) -> anyhow::Result<()> {
    let store = &mut session.todos;
    let now = store.now();

    match command.unwrap_or(Command::List { date: None }) {
        Command::Add { due, title } => {
            let title = title.join(" ");
            let title = title.trim();
            if title.is_empty() {
                return Err(anyhow!("title cannot be empty"));
            }
            let due = parse_optional_day(store, due.as_deref(), now)?;
            let todo = store.add_todo(title, due);
            renderer.print_todo("added", &todo)
        }
        Command::List { date } => {
            let date = parse_optional_day(store, date.as_deref(), now)?.unwrap_or(now);
            let bucket = store.separated_todos_for_date(date);
            renderer.print_day(day_key(date, store.timezone()), &bucket)
        }
        Command::Done { id } => {
            let id = store.resolve_id(&id)?.id.clone();
            let todo = store
                .toggle_todo(&id)
                .ok_or_else(|| anyhow!("todo {id} disappeared"))?;
            renderer.print_todo(if todo.done { "completed" } else { "reopened" }, &todo)
        }
        Command::Edit { id, title, due } => {
            let id = store.resolve_id(&id)?.id.clone();
            let title = match title {
                Some(t) if t.trim().is_empty() => return Err(anyhow!("title cannot be empty")),
                Some(t) => Some(t.trim().to_string()),
                None => None,
            };
            let patch = TodoPatch {
                title,
                due_date: parse_optional_day(store, due.as_deref(), now)?,
                ..TodoPatch::default()
            };
            if patch.is_empty() {
                return Err(anyhow!("nothing to change; pass --title or --due"));
            }
            let todo = store
                .update_todo(&id, patch)
                .ok_or_else(|| anyhow!("todo {id} disappeared"))?;
            renderer.print_todo("updated", &todo)
        }
        Command::Rm { id } => {
            let todo = store.resolve_id(&id)?.clone();
            store.delete_todo(&todo.id);
            renderer.print_todo("deleted", &todo)
        }
        Command::Reorder { date, ids } => {
            let date = parse_optional_day(store, date.as_deref(), now)?.unwrap_or(now);
            let ids: Vec<String> = ids
                .iter()
                .map(|raw| {
                    store
                        .resolve_id(raw)
                        .map(|t| t.id.clone())
                        .unwrap_or_else(|_| raw.clone())
                })
                .collect();
            if !store.reorder_todos_for_date(date, &ids) {
                return Err(anyhow!("none of the given ids is an open target on that day"));
            }
            let bucket = store.separated_todos_for_date(date);
            renderer.print_day(day_key(date, store.timezone()), &bucket)
        }
        Command::Next => match store.next_incomplete_todo() {
            Some(todo) => renderer.print_todo("next", &todo),
            None => {
                println!("no open targets");
                Ok(())
            }
        },
        Command::Remind { now: immediate } => {
            let scheduler = ConsoleScheduler { renderer };
            let reminder = if immediate {
                trigger_app_detected_reminder(store, &scheduler)?
            } else {
                let interval = session.settings.settings().time_based_interval;
                schedule_time_based_reminder(store, &scheduler, interval)?
            };
            if reminder.is_none() {
                println!("no open targets; nothing scheduled");
            }
            Ok(())
        }
        Command::Watch => watch(session, renderer, cfg).await,
        Command::Settings { action } => {
            apply_settings(&mut session.settings, action.unwrap_or(SettingsAction::Show))?;
            renderer.print_settings(session.settings.settings())
        }
    }
}

/// Polls the foreground app through `monitor.command` and prints a reminder
/// each time a monitored app comes up. Runs until interrupted.
async fn watch(session: &Session, renderer: &Renderer, cfg: &Config) -> anyhow::Result<()> {
    let detector = cfg
        .get(KEY_MONITOR_COMMAND)
        .map(|command| CommandDetector::parse(&command))
        .transpose()?
        .map(|detector| Arc::new(detector) as Arc<dyn UsageDetector>);
    let mut monitor = AppMonitor::from_config(detector, cfg)?;
    if !monitor.is_available() {
        return Err(anyhow!(
            "set {KEY_MONITOR_COMMAND} to a program that prints the foreground app"
        ));
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    if !monitor.start(session.settings.settings(), tx) {
        return Err(anyhow!(
            "app detection is off or no app is monitored; see `nudge settings`"
        ));
    }

    let scheduler = ConsoleScheduler { renderer };
    let sent = remind_on_foreground(&mut rx, &session.todos, &scheduler).await;
    info!(sent, "app monitoring ended");
    Ok(())
}

fn apply_settings(settings: &mut SettingsStore, action: SettingsAction) -> anyhow::Result<()> {
    match action {
        SettingsAction::Show => {}
        SettingsAction::Theme { value } => settings.set_theme(Theme::from_str(&value)?),
        SettingsAction::Mode { value } => settings.set_mode(Mode::from_str(&value)?),
        SettingsAction::AddApp { package } => {
            if !settings.add_monitored_app(&package) {
                return Err(anyhow!(
                    "could not add {package}: already monitored, or the free plan limit applies"
                ));
            }
        }
        SettingsAction::RmApp { package } => {
            if !settings.remove_monitored_app(&package) {
                return Err(anyhow!("{package} is not monitored"));
            }
        }
        SettingsAction::Interval { minutes } => settings.set_time_based_interval(minutes),
        SettingsAction::Detection { value } => {
            let enabled = parse_switch(&value)
                .with_context(|| format!("expected on/off for detection, got {value:?}"))?;
            settings.set_app_detection_enabled(enabled);
        }
    }
    Ok(())
}

fn parse_optional_day(
    store: &TodoStore,
    expr: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    expr.map(|raw| parse_day_expr(raw, now, store.timezone()))
        .transpose()
}

fn parse_switch(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(anyhow!("not a switch value: {other}")),
    }
}
