use std::sync::Arc;

use nudge_core::settings::{ALL_APPS, Mode, SettingsStore, Theme};
use nudge_core::storage::{FileBackend, Storage, StorageBackend};
use nudge_core::store::TodoStore;
use tempfile::tempdir;

fn todo_store(backend: &Arc<dyn StorageBackend>) -> TodoStore {
    TodoStore::new(
        Arc::new(Storage::open("todos", Arc::clone(backend))),
        chrono_tz::UTC,
    )
}

fn settings_store(backend: &Arc<dyn StorageBackend>) -> SettingsStore {
    SettingsStore::new(Arc::new(Storage::open("settings", Arc::clone(backend))))
}

#[tokio::test]
async fn todos_survive_a_restart() {
    let temp = tempdir().expect("tempdir");
    let backend: Arc<dyn StorageBackend> =
        Arc::new(FileBackend::open(temp.path()).expect("open backend"));

    let mut store = todo_store(&backend);
    store.load().await;
    let first = store.add_todo("water plants", None);
    let second = store.add_todo("call the bank", None);
    store.toggle_todo(&first.id).expect("toggle");
    assert!(store.has_pending_write());
    store.flush();
    assert!(!store.has_pending_write());
    assert!(temp.path().join("todos").join("todos.data").exists());

    let mut reopened = todo_store(&backend);
    reopened.load().await;
    let summary = |s: &TodoStore| {
        s.all()
            .iter()
            .map(|t| (t.id.clone(), t.title.clone(), t.done, t.priority, t.due_date))
            .collect::<Vec<_>>()
    };
    assert_eq!(summary(&reopened), summary(&store));

    let bucket = reopened.separated_todos_for_date(reopened.now());
    assert_eq!(bucket.incomplete.len(), 1);
    assert_eq!(bucket.incomplete[0].id, second.id);
    assert_eq!(bucket.completed.len(), 1);
    assert_eq!(bucket.completed[0].id, first.id);
}

#[tokio::test]
async fn settings_survive_a_restart() {
    let temp = tempdir().expect("tempdir");
    let backend: Arc<dyn StorageBackend> =
        Arc::new(FileBackend::open(temp.path()).expect("open backend"));

    let mut settings = settings_store(&backend);
    settings.load().await;
    settings.set_theme(Theme::Dark);
    settings.set_mode(Mode::Paid);
    assert!(settings.add_monitored_app(ALL_APPS));
    settings.set_time_based_interval(0);
    settings.set_app_detection_enabled(true);
    settings.flush();

    let mut reopened = settings_store(&backend);
    reopened.load().await;
    let loaded = reopened.settings();
    assert_eq!(loaded, settings.settings());
    assert_eq!(loaded.time_based_interval, 1);
    assert!(loaded.is_monitored("com.any.app"));
}

#[tokio::test]
async fn namespaces_do_not_leak_into_each_other() {
    let temp = tempdir().expect("tempdir");
    let backend: Arc<dyn StorageBackend> =
        Arc::new(FileBackend::open(temp.path()).expect("open backend"));

    let mut settings = settings_store(&backend);
    settings.set_theme(Theme::Light);
    settings.flush();

    let mut store = todo_store(&backend);
    store.load().await;
    assert!(store.is_empty());
    assert!(store.is_loaded());
}
