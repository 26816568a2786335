//! Key-value persistence with a synchronous read cache.
//!
//! Reads are served from memory once [`Storage::ensure_initialized`] has
//! warmed the cache. Writes update the cache first and the backend second.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, anyhow};
use tempfile::NamedTempFile;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

const VALUE_EXTENSION: &str = "data";

pub trait StorageBackend: Send + Sync + fmt::Debug {
    fn load_all(&self, namespace: &str) -> anyhow::Result<BTreeMap<String, String>>;
    fn write(&self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, namespace: &str, key: &str) -> anyhow::Result<()>;
    fn clear(&self, namespace: &str) -> anyhow::Result<()>;
}

/// One file per key under `<root>/<namespace>/`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    #[tracing::instrument(skip(root))]
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        info!(root = %root.display(), "opened file storage");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> anyhow::Result<PathBuf> {
        validate_segment(namespace)?;
        Ok(self.root.join(namespace))
    }

    fn value_path(&self, namespace: &str, key: &str) -> anyhow::Result<PathBuf> {
        validate_segment(key)?;
        Ok(self
            .namespace_dir(namespace)?
            .join(format!("{key}.{VALUE_EXTENSION}")))
    }
}

impl StorageBackend for FileBackend {
    #[tracing::instrument(skip(self))]
    fn load_all(&self, namespace: &str) -> anyhow::Result<BTreeMap<String, String>> {
        let dir = self.namespace_dir(namespace)?;
        let mut out = BTreeMap::new();
        if !dir.exists() {
            debug!(dir = %dir.display(), "namespace directory missing; nothing to load");
            return Ok(out);
        }

        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed reading {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let value = fs::read_to_string(&path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            out.insert(key.to_string(), value);
        }

        debug!(count = out.len(), "loaded stored values");
        Ok(out)
    }

    #[tracing::instrument(skip(self, value), fields(bytes = value.len()))]
    fn write(&self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.value_path(namespace, key)?;
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("value path has no parent: {}", path.display()))?;
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(value.as_bytes())?;
        temp.flush()?;
        temp.persist(&path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn remove(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        let path = self.value_path(namespace, key)?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed removing {}", path.display()))?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn clear(&self, namespace: &str) -> anyhow::Result<()> {
        let dir = self.namespace_dir(namespace)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed removing {}", dir.display()))?;
        }
        Ok(())
    }
}

fn validate_segment(segment: &str) -> anyhow::Result<()> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !segment.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid storage key or namespace: {segment:?}"))
    }
}

/// In-process backend. Counts writes and can be told to fail them.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<(String, String), String>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, namespace: &str, key: &str, value: &str) {
        self.lock()
            .insert((namespace.to_string(), key.to_string()), value.to_string());
    }

    pub fn value(&self, namespace: &str, key: &str) -> Option<String> {
        self.lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StorageBackend for MemoryBackend {
    fn load_all(&self, namespace: &str) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write(&self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("injected write failure for {namespace}/{key}"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.seed(namespace, key, value);
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        self.lock()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn clear(&self, namespace: &str) -> anyhow::Result<()> {
        self.lock().retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}

type Cache = Arc<RwLock<HashMap<String, String>>>;

/// Namespaced view over a backend with an in-memory read cache.
#[derive(Debug)]
pub struct Storage {
    namespace: String,
    backend: Arc<dyn StorageBackend>,
    cache: Cache,
    initialized: OnceCell<()>,
}

impl Storage {
    pub fn open(namespace: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
            cache: Arc::new(RwLock::new(HashMap::new())),
            initialized: OnceCell::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Loads every stored value of the namespace into the cache, once.
    ///
    /// A failed load is logged and the storage continues with whatever the
    /// cache already holds.
    #[tracing::instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn ensure_initialized(&self) {
        self.initialized
            .get_or_init(|| async {
                let backend = Arc::clone(&self.backend);
                let namespace = self.namespace.clone();
                let loaded =
                    tokio::task::spawn_blocking(move || backend.load_all(&namespace)).await;

                match loaded {
                    Ok(Ok(values)) => {
                        let count = values.len();
                        let mut cache = write_cache(&self.cache);
                        for (key, value) in values {
                            cache.entry(key).or_insert(value);
                        }
                        debug!(count, "storage cache warmed");
                    }
                    Ok(Err(err)) => {
                        error!(error = %format!("{err:#}"), "storage initialization failed");
                    }
                    Err(err) => {
                        error!(error = %err, "storage initialization task failed");
                    }
                }
            })
            .await;
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        if !self.is_initialized() {
            debug!(key, "storage read before initialization");
        }
        read_cache(&self.cache).get(key).cloned()
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get_string(key)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|n| !n.is_nan())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_string(key).map(|raw| raw == "true")
    }

    /// Cache, then backend. On backend failure the key is evicted from the
    /// cache and the error returned.
    #[tracing::instrument(skip(self, value), fields(namespace = %self.namespace))]
    pub fn set(&self, key: &str, value: impl Into<String>) -> anyhow::Result<()> {
        let value = value.into();
        write_cache(&self.cache).insert(key.to_string(), value.clone());

        if let Err(err) = self.backend.write(&self.namespace, key, &value) {
            write_cache(&self.cache).remove(key);
            return Err(err.context(format!("failed writing {}/{key}", self.namespace)));
        }
        Ok(())
    }

    /// Updates the cache now and writes to the backend in the background.
    /// A failed write is logged and evicts the key, unless a later `set`
    /// has replaced the value in the meantime.
    #[tracing::instrument(skip(self, value), fields(namespace = %self.namespace))]
    pub fn set_detached(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        write_cache(&self.cache).insert(key.to_string(), value.clone());

        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        let namespace = self.namespace.clone();
        let key = key.to_string();
        let job = move || {
            if let Err(err) = backend.write(&namespace, &key, &value) {
                error!(namespace = %namespace, key = %key, error = %format!("{err:#}"), "background write failed");
                evict_if_unchanged(&cache, &key, &value);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                warn!("no async runtime; writing in place");
                job();
            }
        }
    }

    #[tracing::instrument(skip(self), fields(namespace = %self.namespace))]
    pub fn delete(&self, key: &str) -> anyhow::Result<()> {
        write_cache(&self.cache).remove(key);
        self.backend.remove(&self.namespace, key)
    }

    #[tracing::instrument(skip(self), fields(namespace = %self.namespace))]
    pub fn clear_all(&self) -> anyhow::Result<()> {
        write_cache(&self.cache).clear();
        self.backend.clear(&self.namespace)
    }
}

fn evict_if_unchanged(cache: &Cache, key: &str, failed: &str) {
    let mut cache = write_cache(cache);
    if cache.get(key).is_some_and(|current| current == failed) {
        cache.remove(key);
    }
}

fn read_cache(cache: &Cache) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
    cache.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_cache(cache: &Cache) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
    cache.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{FileBackend, MemoryBackend, Storage, StorageBackend, evict_if_unchanged};

    async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn typed_reads_come_from_the_warmed_cache() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed("settings", "timeBasedInterval", "45");
        backend.seed("settings", "appDetectionEnabled", "true");
        backend.seed("settings", "mode", "paid");
        backend.seed("other", "mode", "free");

        let storage = Storage::open("settings", backend.clone());
        assert_eq!(storage.get_string("mode"), None);

        storage.ensure_initialized().await;
        assert!(storage.is_initialized());
        assert_eq!(storage.get_string("mode").as_deref(), Some("paid"));
        assert_eq!(storage.get_number("timeBasedInterval"), Some(45.0));
        assert_eq!(storage.get_number("mode"), None);
        assert_eq!(storage.get_bool("appDetectionEnabled"), Some(true));
        assert_eq!(storage.get_bool("mode"), Some(false));
        assert_eq!(storage.get_bool("missing"), None);
    }

    #[tokio::test]
    async fn failed_write_evicts_the_cached_value() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = Storage::open("todos", backend.clone());
        storage.ensure_initialized().await;

        storage.set("todos", "[]").expect("first write");
        assert_eq!(backend.writes(), 1);

        backend.set_fail_writes(true);
        assert!(storage.set("todos", "[1]").is_err());
        assert_eq!(storage.get_string("todos"), None);
    }

    #[tokio::test]
    async fn detached_write_reaches_the_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = Storage::open("settings", backend.clone());
        storage.ensure_initialized().await;

        storage.set_detached("theme", "dark");
        assert_eq!(storage.get_string("theme").as_deref(), Some("dark"));

        wait_until("background write", || backend.writes() == 1).await;
        assert_eq!(backend.value("settings", "theme").as_deref(), Some("dark"));
        assert_eq!(storage.get_string("theme").as_deref(), Some("dark"));
    }

    #[tokio::test]
    async fn failed_detached_write_evicts_the_key() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = Storage::open("settings", backend.clone());
        storage.ensure_initialized().await;
        backend.set_fail_writes(true);

        storage.set_detached("theme", "dark");
        wait_until("eviction", || storage.get_string("theme").is_none()).await;
        assert_eq!(backend.writes(), 0);
        assert_eq!(backend.value("settings", "theme"), None);
    }

    #[test]
    fn eviction_spares_a_newer_value() {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        cache
            .write()
            .expect("cache lock")
            .insert("theme".to_string(), "light".to_string());

        evict_if_unchanged(&cache, "theme", "dark");
        assert_eq!(
            cache.read().expect("cache lock").get("theme").map(String::as_str),
            Some("light")
        );

        evict_if_unchanged(&cache, "theme", "light");
        assert!(cache.read().expect("cache lock").get("theme").is_none());
    }

    #[test]
    fn file_backend_roundtrips_values() {
        let temp = tempdir().expect("tempdir");
        let backend = FileBackend::open(temp.path()).expect("open backend");

        backend
            .write("todos", "todos", "[{\"id\":\"a\"}]")
            .expect("write value");
        backend.write("todos", "extra", "1").expect("write value");

        let all = backend.load_all("todos").expect("load");
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("todos").map(String::as_str), Some("[{\"id\":\"a\"}]"));

        backend.remove("todos", "extra").expect("remove");
        assert_eq!(backend.load_all("todos").expect("load").len(), 1);

        backend.clear("todos").expect("clear");
        assert!(backend.load_all("todos").expect("load").is_empty());
    }

    #[test]
    fn file_backend_rejects_path_like_keys() {
        let temp = tempdir().expect("tempdir");
        let backend = FileBackend::open(temp.path()).expect("open backend");
        assert!(backend.write("todos", "../escape", "x").is_err());
        assert!(backend.write("", "todos", "x").is_err());
    }

    #[tokio::test]
    async fn delete_and_clear_drop_cached_values() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = Storage::open("settings", backend.clone());
        storage.ensure_initialized().await;
        storage.set("theme", "dark").expect("set");
        storage.set("mode", "free").expect("set");

        storage.delete("theme").expect("delete");
        assert_eq!(storage.get_string("theme"), None);
        assert_eq!(backend.value("settings", "theme"), None);

        storage.clear_all().expect("clear");
        assert_eq!(storage.get_string("mode"), None);
        assert_eq!(backend.value("settings", "mode"), None);
    }
}
