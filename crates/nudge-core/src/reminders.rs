//! Reminder glue between the store and the platform collaborators.
//!
//! Notification delivery and foreground-app detection are provided by the
//! host through [`ReminderScheduler`] and [`UsageDetector`]. Detection exists
//! on one mobile platform only, so the monitor treats a missing detector as
//! "feature unavailable".

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{Config, KEY_MONITOR_POLL};
use crate::settings::Settings;
use crate::store::TodoStore;
use crate::todo::Todo;

pub const REMINDER_TITLE: &str = "Complete Your Task! 🎯";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub trait UsageDetector: Send + Sync {
    fn has_permission(&self) -> bool;

    /// Package id of the foreground app, or an empty string when unknown.
    fn current_app(&self) -> String;
}

pub trait ReminderScheduler {
    fn cancel_all(&self) -> anyhow::Result<()>;

    /// Replaces any recurring reminder with one firing every
    /// `interval_minutes`.
    fn schedule_recurring(&self, interval_minutes: u32, reminder: &Reminder) -> anyhow::Result<()>;

    fn trigger_immediate(&self, reminder: &Reminder) -> anyhow::Result<()>;
}

/// Notification content for one todo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub title: String,
    pub body: String,
    pub todo_id: String,
}

impl Reminder {
    pub fn for_todo(todo: &Todo) -> Self {
        Self {
            title: REMINDER_TITLE.to_string(),
            body: todo.title.clone(),
            todo_id: todo.id.clone(),
        }
    }
}

/// Cancels existing reminders and, when an incomplete todo exists, schedules
/// a recurring reminder for the next one.
#[instrument(skip(store, scheduler))]
pub fn schedule_time_based_reminder(
    store: &TodoStore,
    scheduler: &dyn ReminderScheduler,
    interval_minutes: u32,
) -> anyhow::Result<Option<Reminder>> {
    scheduler.cancel_all()?;

    let Some(next) = store.next_incomplete_todo() else {
        debug!("no incomplete todo; reminders cancelled");
        return Ok(None);
    };

    let reminder = Reminder::for_todo(&next);
    scheduler.schedule_recurring(interval_minutes.max(1), &reminder)?;
    info!(todo = %next.id, interval_minutes, "scheduled recurring reminder");
    Ok(Some(reminder))
}

/// Fires a one-shot reminder for the next incomplete todo, if any.
#[instrument(skip(store, scheduler))]
pub fn trigger_app_detected_reminder(
    store: &TodoStore,
    scheduler: &dyn ReminderScheduler,
) -> anyhow::Result<Option<Reminder>> {
    let Some(next) = store.next_incomplete_todo() else {
        return Ok(None);
    };

    let reminder = Reminder::for_todo(&next);
    scheduler.trigger_immediate(&reminder)?;
    info!(todo = %next.id, "triggered immediate reminder");
    Ok(Some(reminder))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A monitored app came to the foreground.
    AppForegrounded { package: String },
}

/// Decides which foreground observations are worth a reminder.
///
/// An observation counts when the app is monitored and differs from the last
/// app that counted.
#[derive(Debug, Clone, Default)]
pub struct ForegroundWatch {
    settings: Settings,
    last_detected: String,
}

impl ForegroundWatch {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            last_detected: String::new(),
        }
    }

    pub fn observe(&mut self, current: &str) -> Option<String> {
        if current == self.last_detected || !self.settings.is_monitored(current) {
            return None;
        }
        self.last_detected = current.to_string();
        Some(self.last_detected.clone())
    }
}

/// Asks an external program for the foreground app. The program prints the
/// package id on its first line; failures read as "unknown".
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
}

impl CommandDetector {
    /// `command` is split on whitespace into a program and its arguments.
    pub fn parse(command: &str) -> anyhow::Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("foreground app command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl UsageDetector for CommandDetector {
    fn has_permission(&self) -> bool {
        true
    }

    fn current_app(&self) -> String {
        match Command::new(&self.program).args(&self.args).output() {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string(),
            Ok(output) => {
                warn!(program = %self.program, status = %output.status, "foreground app command failed");
                String::new()
            }
            Err(err) => {
                warn!(program = %self.program, error = %err, "could not run foreground app command");
                String::new()
            }
        }
    }
}

/// Fires an immediate reminder for every foreground event until the sending
/// monitor stops. Returns how many reminders went out.
#[instrument(skip_all)]
pub async fn remind_on_foreground(
    events: &mut mpsc::UnboundedReceiver<MonitorEvent>,
    store: &TodoStore,
    scheduler: &dyn ReminderScheduler,
) -> usize {
    let mut sent = 0;
    while let Some(MonitorEvent::AppForegrounded { package }) = events.recv().await {
        match trigger_app_detected_reminder(store, scheduler) {
            Ok(Some(_)) => sent += 1,
            Ok(None) => debug!(package = %package, "monitored app seen; nothing to remind about"),
            Err(err) => {
                error!(package = %package, error = %format!("{err:#}"), "failed to deliver reminder");
            }
        }
    }
    sent
}

/// Polls the usage detector and reports monitored apps on a channel.
pub struct AppMonitor {
    detector: Option<Arc<dyn UsageDetector>>,
    poll_interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AppMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppMonitor")
            .field("available", &self.is_available())
            .field("poll_interval", &self.poll_interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl AppMonitor {
    pub fn new(detector: Option<Arc<dyn UsageDetector>>, poll_interval: Duration) -> Self {
        Self {
            detector,
            poll_interval,
            handle: None,
        }
    }

    /// Monitor polling every `monitor.poll_secs`.
    pub fn from_config(
        detector: Option<Arc<dyn UsageDetector>>,
        cfg: &Config,
    ) -> anyhow::Result<Self> {
        let poll_interval = cfg.secs(KEY_MONITOR_POLL, DEFAULT_POLL_INTERVAL)?;
        Ok(Self::new(detector, poll_interval.max(Duration::from_secs(1))))
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_available(&self) -> bool {
        self.detector.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Starts polling. Returns false, without starting, when detection is
    /// unavailable, disabled, unpermitted or has nothing to watch.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all)]
    pub fn start(&mut self, settings: &Settings, events: mpsc::UnboundedSender<MonitorEvent>) -> bool {
        let Some(detector) = self.detector.clone() else {
            debug!("usage detection unavailable on this platform");
            return false;
        };
        if !settings.app_detection_enabled || settings.monitored_apps.is_empty() {
            debug!("app detection disabled or nothing monitored");
            return false;
        }
        if !detector.has_permission() {
            warn!("usage access not granted; app monitoring not started");
            return false;
        }

        self.stop();
        let mut watch = ForegroundWatch::new(settings.clone());
        let poll_interval = self.poll_interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let current = detector.current_app();
                trace!(current = %current, "polled foreground app");
                if let Some(package) = watch.observe(&current) {
                    debug!(package = %package, "monitored app in foreground");
                    if events.send(MonitorEvent::AppForegrounded { package }).is_err() {
                        debug!("monitor event receiver dropped; stopping");
                        break;
                    }
                }
            }
        }));

        info!(apps = settings.monitored_apps.len(), ?poll_interval, "started app monitoring");
        true
    }

    /// Stops polling and forgets the last detected app.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("stopped app monitoring");
        }
    }

    pub fn restart(
        &mut self,
        settings: &Settings,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> bool {
        self.stop();
        self.start(settings, events)
    }
}

impl Drop for AppMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{
        AppMonitor, CommandDetector, ForegroundWatch, MonitorEvent, Reminder, ReminderScheduler,
        UsageDetector, remind_on_foreground, schedule_time_based_reminder,
        trigger_app_detected_reminder,
    };
    use crate::config::{Config, KEY_MONITOR_POLL};
    use crate::settings::{ALL_APPS, Settings};
    use crate::storage::{MemoryBackend, Storage};
    use crate::store::TodoStore;

    #[derive(Default)]
    struct RecordingScheduler {
        calls: RefCell<Vec<String>>,
    }

    impl ReminderScheduler for RecordingScheduler {
        fn cancel_all(&self) -> anyhow::Result<()> {
            self.calls.borrow_mut().push("cancel".to_string());
            Ok(())
        }

        fn schedule_recurring(&self, interval_minutes: u32, reminder: &Reminder) -> anyhow::Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("every {interval_minutes}: {}", reminder.body));
            Ok(())
        }

        fn trigger_immediate(&self, reminder: &Reminder) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(format!("now: {}", reminder.body));
            Ok(())
        }
    }

    struct FakeDetector {
        permitted: bool,
        current: Mutex<String>,
    }

    impl FakeDetector {
        fn switch_to(&self, app: &str) {
            *self.current.lock().expect("detector lock") = app.to_string();
        }
    }

    impl UsageDetector for FakeDetector {
        fn has_permission(&self) -> bool {
            self.permitted
        }

        fn current_app(&self) -> String {
            self.current.lock().expect("detector lock").clone()
        }
    }

    fn todo_store() -> TodoStore {
        let storage = Arc::new(Storage::open("todos", Arc::new(MemoryBackend::new())));
        TodoStore::new(storage, chrono_tz::UTC)
    }

    fn watching(apps: &[&str]) -> Settings {
        Settings {
            monitored_apps: apps.iter().map(|a| a.to_string()).collect(),
            app_detection_enabled: true,
            ..Settings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn time_based_reminder_targets_next_incomplete_todo() {
        let mut store = todo_store();
        let scheduler = RecordingScheduler::default();

        let none = schedule_time_based_reminder(&store, &scheduler, 30).expect("schedule");
        assert!(none.is_none());
        assert_eq!(*scheduler.calls.borrow(), vec!["cancel".to_string()]);

        let first = store.add_todo("stretch", None);
        store.add_todo("read", None);
        let reminder = schedule_time_based_reminder(&store, &scheduler, 30)
            .expect("schedule")
            .expect("reminder");
        assert_eq!(reminder.todo_id, first.id);
        assert_eq!(
            scheduler.calls.borrow().last().map(String::as_str),
            Some("every 30: stretch")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn app_detected_reminder_is_a_no_op_without_todos() {
        let mut store = todo_store();
        let scheduler = RecordingScheduler::default();
        assert!(
            trigger_app_detected_reminder(&store, &scheduler)
                .expect("trigger")
                .is_none()
        );
        assert!(scheduler.calls.borrow().is_empty());

        store.add_todo("focus", None);
        trigger_app_detected_reminder(&store, &scheduler).expect("trigger");
        assert_eq!(*scheduler.calls.borrow(), vec!["now: focus".to_string()]);
    }

    #[test]
    fn watch_reports_only_changes_to_monitored_apps() {
        let mut watch = ForegroundWatch::new(watching(&["com.video"]));
        assert_eq!(watch.observe(""), None);
        assert_eq!(watch.observe("com.mail"), None);
        assert_eq!(watch.observe("com.video").as_deref(), Some("com.video"));
        assert_eq!(watch.observe("com.video"), None);

        let mut all = ForegroundWatch::new(watching(&[ALL_APPS]));
        assert_eq!(all.observe("com.any").as_deref(), Some("com.any"));
        assert_eq!(all.observe("com.other").as_deref(), Some("com.other"));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_needs_detector_permission_and_apps() {
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut absent = AppMonitor::new(None, Duration::from_secs(3));
        assert!(!absent.start(&watching(&["com.video"]), tx.clone()));

        let denied: Arc<dyn UsageDetector> = Arc::new(FakeDetector {
            permitted: false,
            current: Mutex::new(String::new()),
        });
        let mut monitor = AppMonitor::new(Some(denied), Duration::from_secs(3));
        assert!(!monitor.start(&watching(&["com.video"]), tx.clone()));

        let granted: Arc<dyn UsageDetector> = Arc::new(FakeDetector {
            permitted: true,
            current: Mutex::new(String::new()),
        });
        let mut monitor = AppMonitor::new(Some(granted), Duration::from_secs(3));
        assert!(!monitor.start(&watching(&[]), tx.clone()));
        assert!(!monitor.start(&Settings::default(), tx));
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_emits_when_a_monitored_app_appears() {
        let detector = Arc::new(FakeDetector {
            permitted: true,
            current: Mutex::new("com.launcher".to_string()),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = AppMonitor::new(
            Some(detector.clone() as Arc<dyn UsageDetector>),
            Duration::from_secs(3),
        );
        assert!(monitor.start(&watching(&["com.video"]), tx));
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        detector.switch_to("com.video");
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        assert_eq!(
            event,
            MonitorEvent::AppForegrounded {
                package: "com.video".to_string()
            }
        );

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn foreground_events_become_immediate_reminders() {
        let mut store = todo_store();
        store.add_todo("focus", None);
        let scheduler = RecordingScheduler::default();

        let detector = Arc::new(FakeDetector {
            permitted: true,
            current: Mutex::new("com.video".to_string()),
        });
        let mut cfg = Config::default();
        cfg.apply_overrides(vec![(KEY_MONITOR_POLL.to_string(), "2".to_string())]);
        let mut monitor = AppMonitor::from_config(
            Some(detector.clone() as Arc<dyn UsageDetector>),
            &cfg,
        )
        .expect("monitor from config");
        assert_eq!(monitor.poll_interval(), Duration::from_secs(2));

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(monitor.start(&watching(&["com.video"]), tx));

        let listening = tokio::time::timeout(
            Duration::from_secs(10),
            remind_on_foreground(&mut rx, &store, &scheduler),
        )
        .await;
        assert!(listening.is_err());
        assert_eq!(*scheduler.calls.borrow(), vec!["now: focus".to_string()]);

        monitor.stop();
        assert_eq!(remind_on_foreground(&mut rx, &store, &scheduler).await, 0);
    }

    #[test]
    fn bad_poll_interval_is_a_config_error() {
        let mut cfg = Config::default();
        cfg.apply_overrides(vec![(KEY_MONITOR_POLL.to_string(), "often".to_string())]);
        assert!(AppMonitor::from_config(None, &cfg).is_err());
    }

    #[test]
    fn command_detector_reads_first_line() {
        assert!(CommandDetector::parse("   ").is_err());

        let detector = CommandDetector::parse("echo com.video").expect("parse");
        assert!(detector.has_permission());
        assert_eq!(detector.current_app(), "com.video");

        let missing = CommandDetector::parse("nudge-no-such-program").expect("parse");
        assert_eq!(missing.current_app(), "");
    }
}
