//! Concurrently-read, file-watched settings store.
//!
//! Readers call [`SettingsStore::current`] and get an `Arc<Settings>`
//! snapshot; writers go through [`SettingsStore::update`] which is
//! serialized by a single mutex.  A `notify` watcher observes the backing
//! file and coalesces the event bursts most file systems emit for one
//! logical write behind a 500 ms debounce window.
//!
//! Failure policy: a missing or unreadable file degrades to default
//! settings after bounded retries and is never surfaced to callers; watcher
//! errors are logged and dropped.  A missed external edit is acceptable, a
//! crash is not.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use super::model::Settings;

/// Notifications closer together than this are discarded.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
/// Load attempts before falling back to defaults.
const LOAD_ATTEMPTS: u32 = 3;
/// Pause between load attempts, to ride out a concurrent external writer.
const LOAD_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Observer invoked with every committed snapshot.
///
/// Observers run synchronously on the committing thread (a request task for
/// programmatic updates, the watcher thread for external edits) and must not
/// call back into [`SettingsStore::update`].
pub type ChangeObserver = Box<dyn Fn(&Settings) + Send + Sync>;

/// Transform applied to a candidate snapshot before it is persisted or made
/// visible.  Used for the clear-to-hashed password migration.
pub type PrePersistHook = Box<dyn Fn(&mut Settings) + Send + Sync>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SettingsStore {
    inner: Arc<Inner>,
    // Kept so the OS watch handle is released when the store is closed or
    // dropped.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

struct Inner {
    file_path: PathBuf,
    current: RwLock<Arc<Settings>>,
    write_lock: Mutex<()>,
    observers: RwLock<Vec<ChangeObserver>>,
    pre_persist: RwLock<Vec<PrePersistHook>>,
    last_accepted: Mutex<Option<Instant>>,
}

impl SettingsStore {
    /// Open the store against `file_path`, resolved to an absolute path.
    ///
    /// A missing file is created immediately with default settings; an
    /// unreadable or corrupt file degrades to defaults without persisting
    /// over the original.
    pub fn open(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = absolutize(file_path.as_ref())?;
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create settings directory: {}", parent.display())
            })?;
        }

        let settings = if file_path.is_file() {
            load_or_default(&file_path)
        } else {
            let defaults = Settings::default();
            persist(&file_path, &defaults)?;
            info!(path = %file_path.display(), "created settings file with defaults");
            defaults
        };
        settings.warn_on_duplicate_accounts();

        Ok(Self {
            inner: Arc::new(Inner {
                file_path,
                current: RwLock::new(Arc::new(settings)),
                write_lock: Mutex::new(()),
                observers: RwLock::new(Vec::new()),
                pre_persist: RwLock::new(Vec::new()),
                last_accepted: Mutex::new(None),
            }),
            watcher: Mutex::new(None),
        })
    }

    /// Latest committed snapshot.  Cheap; never blocks on writers beyond the
    /// read-lock handoff.
    pub fn current(&self) -> Arc<Settings> {
        self.inner.current()
    }

    /// Absolute path of the backing file.
    pub fn file_path(&self) -> &Path {
        &self.inner.file_path
    }

    /// Apply `transform` to a copy of the current snapshot, run the
    /// pre-persist hooks, persist (when `persist` is set) and commit.
    ///
    /// The snapshot only becomes visible after the file write succeeds;
    /// observers are notified after the commit.
    pub fn update<F>(&self, transform: F, persist: bool) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        self.inner.update(transform, persist)
    }

    /// Append an observer.  Observers fire for every committed snapshot,
    /// whether the change came from [`update`](Self::update) or from an
    /// external file edit, in registration order.
    pub fn on_change(&self, observer: impl Fn(&Settings) + Send + Sync + 'static) {
        self.inner
            .observers
            .write()
            .expect("settings observer lock poisoned")
            .push(Box::new(observer));
    }

    /// Append a pre-persist transform.  Hooks run on every candidate
    /// snapshot before it is persisted or made visible.
    pub fn before_persist(&self, hook: impl Fn(&mut Settings) + Send + Sync + 'static) {
        self.inner
            .pre_persist
            .write()
            .expect("settings hook lock poisoned")
            .push(Box::new(hook));
    }

    /// Start watching the backing file for external modifications.
    pub fn watch(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let file_name = self
            .inner
            .file_path
            .file_name()
            .map(|n| n.to_os_string())
            .context("settings path has no file name")?;

        let mut watcher = RecommendedWatcher::new(
            move |event: std::result::Result<notify::Event, notify::Error>| match event {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        inner.handle_file_event();
                    }
                }
                Err(err) => error!(error = %err, "settings watcher error"),
            },
            notify::Config::default(),
        )
        .context("failed to initialize settings watcher")?;

        let watch_dir = self
            .inner
            .file_path
            .parent()
            .context("settings path has no parent directory")?;
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", watch_dir.display()))?;

        *self.watcher.lock().expect("watcher lock poisoned") = Some(watcher);
        info!(path = %self.inner.file_path.display(), "watching settings file");
        Ok(())
    }

    /// Release the file watcher.  Idempotent; also happens on drop.
    pub fn close(&self) {
        self.watcher.lock().expect("watcher lock poisoned").take();
    }

    #[cfg(test)]
    pub(crate) fn simulate_file_event(&self) {
        self.inner.handle_file_event();
    }
}

impl Inner {
    fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read().expect("settings lock poisoned"))
    }

    fn update<F>(&self, transform: F, persist_to_disk: bool) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        let guard = self.write_lock.lock().expect("settings write lock poisoned");

        let mut candidate = (*self.current()).clone();
        transform(&mut candidate);
        self.apply_pre_persist(&mut candidate);

        if persist_to_disk {
            persist(&self.file_path, &candidate)?;
        }

        let snapshot = Arc::new(candidate);
        *self.current.write().expect("settings lock poisoned") = Arc::clone(&snapshot);
        drop(guard);

        self.notify_observers(&snapshot);
        Ok(())
    }

    /// Debounced entry point for file-change notifications.
    fn handle_file_event(&self) {
        {
            let mut last = self.last_accepted.lock().expect("debounce lock poisoned");
            if let Some(prev) = *last {
                if prev.elapsed() < DEBOUNCE_WINDOW {
                    debug!("settings change notification discarded inside debounce window");
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        self.reload();
    }

    /// Full reload from disk followed by observer notification.  The loaded
    /// value goes through the pre-persist hooks (an external editor may have
    /// introduced clear-text passwords) but is not written back.
    fn reload(&self) {
        let guard = self.write_lock.lock().expect("settings write lock poisoned");

        let mut loaded = load_or_default(&self.file_path);
        loaded.warn_on_duplicate_accounts();
        self.apply_pre_persist(&mut loaded);

        let snapshot = Arc::new(loaded);
        *self.current.write().expect("settings lock poisoned") = Arc::clone(&snapshot);
        drop(guard);

        info!(path = %self.file_path.display(), "settings reloaded from file change");
        self.notify_observers(&snapshot);
    }

    fn apply_pre_persist(&self, candidate: &mut Settings) {
        for hook in self
            .pre_persist
            .read()
            .expect("settings hook lock poisoned")
            .iter()
        {
            hook(candidate);
        }
    }

    fn notify_observers(&self, snapshot: &Settings) {
        for observer in self
            .observers
            .read()
            .expect("settings observer lock poisoned")
            .iter()
        {
            observer(snapshot);
        }
    }
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        let cwd = std::env::current_dir().context("failed to resolve working directory")?;
        Ok(cwd.join(path))
    }
}

/// Read and deserialize the settings file, retrying briefly on sharing
/// conflicts with a concurrent external writer.  Falls back to defaults;
/// this function never fails.
fn load_or_default(path: &Path) -> Settings {
    for attempt in 1..=LOAD_ATTEMPTS {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Settings>(&text) {
                Ok(settings) => return settings,
                Err(err) => {
                    warn!(attempt, error = %err, "failed to parse settings file");
                }
            },
            Err(err) => {
                warn!(attempt, error = %err, "failed to read settings file");
            }
        }
        if attempt < LOAD_ATTEMPTS {
            std::thread::sleep(LOAD_RETRY_PAUSE);
        }
    }

    warn!(path = %path.display(), "falling back to default settings");
    Settings::default()
}

/// Serialize with stable human-diffable formatting and overwrite the file.
fn persist(path: &Path, settings: &Settings) -> Result<()> {
    let json = serde_json::to_string_pretty(settings).context("failed to serialize settings")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write settings file: {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::settings::model::{Account, BasicAuth, PASSWORD_TYPE_CLEAR, PASSWORD_TYPE_HASHED};

    fn store_in(dir: &Path) -> SettingsStore {
        SettingsStore::open(dir.join("settings.json")).unwrap()
    }

    #[test]
    fn open_creates_file_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        assert!(store.file_path().is_file());
        assert_eq!(store.current().base_path, "/gitrepos");
    }

    #[test]
    fn open_tolerates_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(*store.current(), Settings::default());
        // The corrupt file is left in place, not clobbered.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn update_persists_and_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        store
            .update(|s| s.repositories_directory = "repos2".into(), true)
            .unwrap();

        assert_eq!(store.current().repositories_directory, "repos2");
        let reread: Settings =
            serde_json::from_str(&std::fs::read_to_string(store.file_path()).unwrap()).unwrap();
        assert_eq!(reread.repositories_directory, "repos2");
    }

    #[test]
    fn update_without_persist_leaves_file_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let before = std::fs::read_to_string(store.file_path()).unwrap();

        store
            .update(|s| s.repositories_directory = "memory-only".into(), false)
            .unwrap();

        assert_eq!(store.current().repositories_directory, "memory-only");
        assert_eq!(std::fs::read_to_string(store.file_path()).unwrap(), before);
    }

    #[test]
    fn observers_fire_on_update_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        store.on_change(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.update(|_| {}, false).unwrap();
        store.simulate_file_event();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pre_persist_hook_runs_before_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.before_persist(crate::gateway::auth::migrate_clear_passwords);

        store
            .update(
                |s| {
                    s.accounts.push(Account {
                        account_name: "alice".into(),
                        password: "secret".into(),
                        password_type: PASSWORD_TYPE_CLEAR.into(),
                        basic_auths: vec![BasicAuth {
                            username: "alice".into(),
                            password: "secret".into(),
                            password_type: PASSWORD_TYPE_CLEAR.into(),
                        }],
                    });
                },
                true,
            )
            .unwrap();

        // Round-trip: the persisted file never saw the clear password.
        let text = std::fs::read_to_string(store.file_path()).unwrap();
        assert!(!text.contains("\"secret\""));
        let reread: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(reread.accounts[0].password_type, PASSWORD_TYPE_HASHED);
        assert_eq!(reread.accounts[0].basic_auths[0].password_type, PASSWORD_TYPE_HASHED);
        assert_eq!(reread, *store.current());
    }

    #[test]
    fn debounce_coalesces_rapid_notifications() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let reloads = Arc::new(AtomicUsize::new(0));
        let reloads_clone = Arc::clone(&reloads);
        store.on_change(move |_| {
            reloads_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Two notifications inside the window trigger exactly one reload.
        store.simulate_file_event();
        store.simulate_file_event();
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reload_picks_up_external_edit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let mut edited = (*store.current()).clone();
        edited.base_path = "/elsewhere".into();
        std::fs::write(
            store.file_path(),
            serde_json::to_string_pretty(&edited).unwrap(),
        )
        .unwrap();

        store.simulate_file_event();
        assert_eq!(store.current().base_path, "/elsewhere");
    }
}
