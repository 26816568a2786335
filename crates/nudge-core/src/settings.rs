use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::persist::{Debouncer, Snapshot};
use crate::storage::Storage;

/// Monitored-app entry that stands for every app.
pub const ALL_APPS: &str = "__ALL__";
pub const FREE_TIER_APP_LIMIT: usize = 2;
pub const DEFAULT_REMINDER_INTERVAL_MINUTES: u32 = 60;
pub const DEFAULT_SETTINGS_DEBOUNCE: Duration = Duration::from_millis(100);

const THEME_KEY: &str = "theme";
const MODE_KEY: &str = "mode";
const MONITORED_APPS_KEY: &str = "monitoredApps";
const INTERVAL_KEY: &str = "timeBasedInterval";
const DETECTION_KEY: &str = "appDetectionEnabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
            Self::System => "system",
        }
    }
}

impl FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            "system" => Ok(Self::System),
            other => Err(anyhow!("unknown theme: {other}")),
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Free,
    Paid,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
        }
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "paid" => Ok(Self::Paid),
            other => Err(anyhow!("unknown mode: {other}")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub theme: Theme,
    pub mode: Mode,
    pub monitored_apps: Vec<String>,
    /// Minutes between time-based reminders.
    pub time_based_interval: u32,
    pub app_detection_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            mode: Mode::default(),
            monitored_apps: Vec::new(),
            time_based_interval: DEFAULT_REMINDER_INTERVAL_MINUTES,
            app_detection_enabled: false,
        }
    }
}

impl Settings {
    /// Whether a foreground `package` should trigger a reminder.
    pub fn is_monitored(&self, package: &str) -> bool {
        !package.is_empty()
            && self
                .monitored_apps
                .iter()
                .any(|app| app == ALL_APPS || app == package)
    }
}

impl Snapshot for Settings {
    fn entries(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(vec![
            (THEME_KEY.to_string(), self.theme.as_str().to_string()),
            (MODE_KEY.to_string(), self.mode.as_str().to_string()),
            (
                MONITORED_APPS_KEY.to_string(),
                serde_json::to_string(&self.monitored_apps)?,
            ),
            (INTERVAL_KEY.to_string(), self.time_based_interval.to_string()),
            (DETECTION_KEY.to_string(), self.app_detection_enabled.to_string()),
        ])
    }
}

#[derive(Debug)]
pub struct SettingsStore {
    settings: Settings,
    storage: Arc<Storage>,
    persister: Debouncer<Settings>,
}

impl SettingsStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            settings: Settings::default(),
            persister: Debouncer::new(Arc::clone(&storage), DEFAULT_SETTINGS_DEBOUNCE),
            storage,
        }
    }

    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.persister.cancel();
        self.persister = Debouncer::new(Arc::clone(&self.storage), delay);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Reads stored settings. Missing or unreadable values fall back to
    /// defaults.
    #[instrument(skip(self), fields(namespace = %self.storage.namespace()))]
    pub async fn load(&mut self) {
        self.storage.ensure_initialized().await;
        let storage = &self.storage;

        let theme = storage
            .get_string(THEME_KEY)
            .and_then(|raw| parse_or_warn::<Theme>(THEME_KEY, &raw))
            .unwrap_or_default();
        let mode = storage
            .get_string(MODE_KEY)
            .and_then(|raw| parse_or_warn::<Mode>(MODE_KEY, &raw))
            .unwrap_or_default();
        let monitored_apps = storage
            .get_string(MONITORED_APPS_KEY)
            .and_then(|raw| match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(apps) => Some(apps),
                Err(err) => {
                    warn!(error = %err, "stored monitored apps are unreadable");
                    None
                }
            })
            .unwrap_or_default();
        let time_based_interval = storage
            .get_number(INTERVAL_KEY)
            .filter(|n| *n >= 1.0 && *n <= f64::from(u32::MAX))
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_REMINDER_INTERVAL_MINUTES);
        let app_detection_enabled = storage.get_bool(DETECTION_KEY).unwrap_or(false);

        self.settings = Settings {
            theme,
            mode,
            monitored_apps,
            time_based_interval,
            app_detection_enabled,
        };
        info!(
            theme = %self.settings.theme,
            mode = %self.settings.mode,
            apps = self.settings.monitored_apps.len(),
            "loaded settings"
        );
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.settings.theme = theme;
        self.changed();
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.settings.mode = mode;
        self.changed();
    }

    /// Adds an app to the monitored list. Returns whether the list changed.
    ///
    /// [`ALL_APPS`] needs paid mode and replaces the list. Free mode allows
    /// at most [`FREE_TIER_APP_LIMIT`] concrete apps. A concrete app replaces
    /// [`ALL_APPS`].
    #[instrument(skip(self))]
    pub fn add_monitored_app(&mut self, package: &str) -> bool {
        let package = package.trim();
        if package.is_empty() {
            return false;
        }
        let apps = &mut self.settings.monitored_apps;

        if package == ALL_APPS {
            if self.settings.mode == Mode::Free {
                debug!("all-apps monitoring needs paid mode");
                return false;
            }
            *apps = vec![ALL_APPS.to_string()];
        } else if apps.iter().any(|app| app == ALL_APPS) {
            *apps = vec![package.to_string()];
        } else if apps.iter().any(|app| app == package) {
            return false;
        } else if self.settings.mode == Mode::Free && apps.len() >= FREE_TIER_APP_LIMIT {
            debug!(limit = FREE_TIER_APP_LIMIT, "free tier app limit reached");
            return false;
        } else {
            apps.push(package.to_string());
        }

        self.changed();
        true
    }

    #[instrument(skip(self))]
    pub fn remove_monitored_app(&mut self, package: &str) -> bool {
        let before = self.settings.monitored_apps.len();
        self.settings.monitored_apps.retain(|app| app != package);
        let removed = before != self.settings.monitored_apps.len();
        if removed {
            self.changed();
        }
        removed
    }

    /// Sets the reminder interval in minutes; zero is raised to one.
    pub fn set_time_based_interval(&mut self, minutes: u32) {
        self.settings.time_based_interval = minutes.max(1);
        self.changed();
    }

    pub fn set_app_detection_enabled(&mut self, enabled: bool) {
        self.settings.app_detection_enabled = enabled;
        self.changed();
    }

    pub fn has_pending_write(&self) -> bool {
        self.persister.is_pending()
    }

    pub fn flush(&mut self) {
        self.persister.flush();
    }

    fn changed(&mut self) {
        self.persister.schedule(self.settings.clone());
    }
}

fn parse_or_warn<T: FromStr<Err = anyhow::Error>>(key: &str, raw: &str) -> Option<T> {
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "ignoring stored setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ALL_APPS, Mode, SettingsStore, Theme};
    use crate::storage::{MemoryBackend, Storage};

    fn store(backend: &Arc<MemoryBackend>) -> SettingsStore {
        SettingsStore::new(Arc::new(Storage::open("settings", backend.clone())))
    }

    #[tokio::test]
    async fn defaults_apply_when_nothing_is_stored() {
        let backend = Arc::new(MemoryBackend::new());
        let mut settings = store(&backend);
        settings.load().await;

        let s = settings.settings();
        assert_eq!(s.theme, Theme::System);
        assert_eq!(s.mode, Mode::Free);
        assert!(s.monitored_apps.is_empty());
        assert_eq!(s.time_based_interval, 60);
        assert!(!s.app_detection_enabled);
    }

    #[tokio::test]
    async fn loads_stored_values_and_skips_bad_ones() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed("settings", "theme", "dark");
        backend.seed("settings", "mode", "enterprise");
        backend.seed("settings", "monitoredApps", "[\"com.video\"]");
        backend.seed("settings", "timeBasedInterval", "0");
        backend.seed("settings", "appDetectionEnabled", "true");

        let mut settings = store(&backend);
        settings.load().await;

        let s = settings.settings();
        assert_eq!(s.theme, Theme::Dark);
        assert_eq!(s.mode, Mode::Free);
        assert_eq!(s.monitored_apps, vec!["com.video".to_string()]);
        assert_eq!(s.time_based_interval, 60);
        assert!(s.app_detection_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn free_tier_caps_monitored_apps() {
        let backend = Arc::new(MemoryBackend::new());
        let mut settings = store(&backend);
        settings.load().await;

        assert!(settings.add_monitored_app("com.a"));
        assert!(settings.add_monitored_app("com.b"));
        assert!(!settings.add_monitored_app("com.c"));
        assert!(!settings.add_monitored_app("com.a"));
        assert!(!settings.add_monitored_app(ALL_APPS));

        settings.set_mode(Mode::Paid);
        assert!(settings.add_monitored_app("com.c"));
        assert!(settings.add_monitored_app(ALL_APPS));
        assert_eq!(settings.settings().monitored_apps, vec![ALL_APPS.to_string()]);
        assert!(settings.settings().is_monitored("com.anything"));

        assert!(settings.add_monitored_app("com.d"));
        assert_eq!(settings.settings().monitored_apps, vec!["com.d".to_string()]);
        assert!(settings.remove_monitored_app("com.d"));
        assert!(!settings.remove_monitored_app("com.d"));
    }

    #[tokio::test(start_paused = true)]
    async fn changes_are_written_as_one_debounced_batch() {
        let backend = Arc::new(MemoryBackend::new());
        let mut settings = store(&backend);
        settings.load().await;

        settings.set_theme(Theme::Light);
        settings.set_time_based_interval(15);
        settings.set_app_detection_enabled(true);
        assert!(settings.has_pending_write());
        assert_eq!(backend.writes(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        while settings.has_pending_write() {
            tokio::task::yield_now().await;
        }
        // One batch of five keys.
        assert_eq!(backend.writes(), 5);
        assert_eq!(backend.value("settings", "theme").as_deref(), Some("light"));
        assert_eq!(
            backend.value("settings", "timeBasedInterval").as_deref(),
            Some("15")
        );
        assert_eq!(
            backend.value("settings", "appDetectionEnabled").as_deref(),
            Some("true")
        );

        let mut reloaded = store(&backend);
        reloaded.load().await;
        assert_eq!(reloaded.settings(), settings.settings());
    }
}
