//! Change-triggered autosave.
//!
//! File system events from the live configuration tree are filtered by the
//! configured watch selectors and debounced per changed path. When a path
//! settles, the file is copied into the history store and committed as an
//! autosave.

use crate::backend::HistoryBackend;
use crate::config::{BackendMode, Settings, WatchSelector};
use crate::utils::errors::{Result, TimeMachineError};
use crate::utils::paths::{is_hidden, relative_slash};
use crate::writer::SnapshotWriter;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use glob::{MatchOptions, Pattern};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

struct Pending {
    generation: u64,
    timer: AbortHandle,
}

/// Per-key trailing-edge debouncer.
///
/// Pushing a key re-arms its timer and replaces its value; when a timer
/// expires the last value is sent on the channel returned by [`new`](Self::new).
pub struct Debouncer<V> {
    window: Duration,
    pending: Arc<DashMap<String, Pending>>,
    generation: AtomicU64,
    stopped: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<V>,
    runtime: Handle,
}

impl<V: Send + 'static> Debouncer<V> {
    /// Must be called from within a tokio runtime.
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<V>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            window,
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
            tx,
            runtime: Handle::current(),
        };
        (debouncer, rx)
    }

    pub fn push(&self, key: String, value: V) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);

        // Entry guard stays held until the new timer is recorded.
        match self.pending.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get().timer.abort();
                let timer = self.arm(key, generation, value);
                occupied.insert(Pending { generation, timer });
            }
            Entry::Vacant(vacant) => {
                let timer = self.arm(key, generation, value);
                vacant.insert(Pending { generation, timer });
            }
        }
    }

    fn arm(&self, key: String, generation: u64, value: V) -> AbortHandle {
        let window = self.window;
        let pending = self.pending.clone();
        let stopped = self.stopped.clone();
        let tx = self.tx.clone();

        self.runtime
            .spawn(async move {
                tokio::time::sleep(window).await;
                let current = pending
                    .remove_if(&key, |_, p| {
                        p.generation == generation && !stopped.load(Ordering::SeqCst)
                    })
                    .is_some();
                if current {
                    let _ = tx.send(value);
                }
            })
            .abort_handle()
    }

    /// Keys with a timer still running.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Cancel every pending timer; later pushes are ignored.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.pending.retain(|_, p| {
            p.timer.abort();
            false
        });
    }
}

/// Decides which changed paths under the live root are worth an autosave.
#[derive(Debug, Clone)]
pub struct WatchMatcher {
    live_root: PathBuf,
    patterns: Vec<Pattern>,
}

impl WatchMatcher {
    pub fn new(live_root: impl Into<PathBuf>, selectors: &[WatchSelector], esphome: bool, packages: bool) -> Self {
        let mut sources: Vec<&str> = Vec::new();
        for selector in selectors {
            match selector {
                WatchSelector::Config => sources.extend(["*.yaml", "*.yml"]),
                WatchSelector::Lovelace => sources.push(".storage/lovelace*"),
                WatchSelector::Esphome if esphome => {
                    sources.extend(["esphome/**/*.yaml", "esphome/**/*.yml"])
                }
                WatchSelector::Packages if packages => {
                    sources.extend(["packages/**/*.yaml", "packages/**/*.yml"])
                }
                _ => {}
            }
        }

        let patterns = sources
            .into_iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();
        Self {
            live_root: live_root.into(),
            patterns,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.backup.live_config_path,
            &settings.watch.paths,
            settings.features.esphome,
            settings.features.packages,
        )
    }

    pub fn live_root(&self) -> &Path {
        &self.live_root
    }

    /// Root-relative path when `path` should trigger an autosave.
    pub fn relative_match(&self, path: &Path) -> Option<String> {
        let rel = relative_slash(&self.live_root, path)?;
        let lovelace = rel.starts_with(".storage/lovelace");
        if !lovelace && rel.split('/').any(is_hidden) {
            return None;
        }

        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.patterns
            .iter()
            .any(|p| p.matches_with(&rel, options))
            .then_some(rel)
    }
}

/// Handles one settled change.
pub type ChangeHandler = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Copy the changed file into the history store and commit it as an autosave.
pub fn autosave_handler(settings: &Settings) -> ChangeHandler {
    let live_root = settings.backup.live_config_path.clone();
    let backup_root = settings.backup.backup_folder_path.clone();
    let writer = SnapshotWriter::from_settings(settings);

    Arc::new(move |path: PathBuf| -> BoxFuture<'static, Result<()>> {
        let live_root = live_root.clone();
        let backup_root = backup_root.clone();
        let writer = writer.clone();
        Box::pin(async move {
            let report = tokio::task::spawn_blocking(move || {
                let backend = HistoryBackend::new(backup_root);
                writer.write_file(&backend, &live_root, &path)
            })
            .await
            .map_err(|e| TimeMachineError::Task(e.to_string()))??;

            match report.outcome.snapshot() {
                Some(snapshot) => tracing::info!(id = %snapshot.id, "Autosave committed"),
                None => tracing::debug!("Autosave found no changes"),
            }
            Ok(())
        })
    })
}

pub struct ChangeWatcher {
    watcher: Option<RecommendedWatcher>,
    debouncer: Arc<Debouncer<PathBuf>>,
    token: CancellationToken,
    consumer: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Watch the live tree described by `settings`. Requires history mode.
    pub fn start(settings: &Settings) -> Result<Self> {
        if settings.backup.mode != BackendMode::History {
            return Err(TimeMachineError::InvalidInput(
                "change watching requires history mode".into(),
            ));
        }
        Self::start_with(
            WatchMatcher::from_settings(settings),
            settings.debounce(),
            autosave_handler(settings),
        )
    }

    /// Watch with an explicit matcher, window and handler.
    pub fn start_with(matcher: WatchMatcher, window: Duration, handler: ChangeHandler) -> Result<Self> {
        let live_root = matcher.live_root().to_path_buf();
        if !live_root.is_dir() {
            return Err(TimeMachineError::not_found("live configuration directory", live_root));
        }

        let (debouncer, mut rx) = Debouncer::new(window);
        let debouncer = Arc::new(debouncer);

        let sink = debouncer.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in event.paths {
                    if let Some(rel) = matcher.relative_match(&path) {
                        tracing::debug!(file = %rel, "Change detected");
                        sink.push(rel, path);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "File watcher error"),
        })?;
        watcher.watch(&live_root, RecursiveMode::Recursive)?;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let consumer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    next = rx.recv() => {
                        let Some(path) = next else { break };
                        if cancelled.is_cancelled() {
                            break;
                        }
                        if let Err(e) = handler(path.clone()).await {
                            tracing::warn!(path = %path.display(), error = %e, "Autosave failed");
                        }
                    }
                }
            }
        });

        tracing::info!(root = %live_root.display(), window_ms = window.as_millis() as u64, "Change watcher started");
        Ok(Self {
            watcher: Some(watcher),
            debouncer,
            token,
            consumer: Some(consumer),
        })
    }

    /// Stop watching. No handler runs after this returns.
    pub async fn stop(&mut self) {
        self.token.cancel();
        self.debouncer.stop();
        self.watcher.take();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.await;
        }
        tracing::info!("Change watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_debounce_coalesces_per_key() {
        let (debouncer, mut rx) = Debouncer::new(WINDOW);
        debouncer.push("automations.yaml".into(), 1);
        debouncer.push("automations.yaml".into(), 2);
        debouncer.push("automations.yaml".into(), 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert!(rx.try_recv().is_err());
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_fire_independently() {
        let (debouncer, mut rx) = Debouncer::new(WINDOW);
        debouncer.push("a.yaml".into(), "a");
        debouncer.push("b.yaml".into(), "b");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut fired = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        fired.sort();
        assert_eq!(fired, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_rearm_extends_window() {
        let (debouncer, mut rx) = Debouncer::new(Duration::from_millis(120));
        debouncer.push("a.yaml".into(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        debouncer.push("a.yaml".into(), 2);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending() {
        let (debouncer, mut rx) = Debouncer::new(WINDOW);
        debouncer.push("a.yaml".into(), 1);
        debouncer.stop();
        debouncer.push("b.yaml".into(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_matcher_patterns() {
        let all = [
            WatchSelector::Config,
            WatchSelector::Lovelace,
            WatchSelector::Esphome,
            WatchSelector::Packages,
        ];
        let root = Path::new("/config");
        let matcher = WatchMatcher::new(root, &all, true, false);

        assert_eq!(
            matcher.relative_match(&root.join("automations.yaml")).as_deref(),
            Some("automations.yaml")
        );
        assert!(matcher.relative_match(&root.join(".storage/lovelace.dashboard")).is_some());
        assert!(matcher.relative_match(&root.join(".storage/core.config")).is_none());
        assert!(matcher.relative_match(&root.join("esphome/node.yaml")).is_some());
        assert!(matcher.relative_match(&root.join("esphome/sub/node.yaml")).is_some());
        assert!(matcher.relative_match(&root.join("esphome/.esphome/x.yaml")).is_none());
        assert!(matcher.relative_match(&root.join("packages/x.yaml")).is_none());
        assert!(matcher.relative_match(&root.join("custom/x.yaml")).is_none());
        assert!(matcher.relative_match(&root.join(".hidden.yaml")).is_none());
        assert!(matcher.relative_match(Path::new("/elsewhere/x.yaml")).is_none());
    }

    fn recording_handler() -> (ChangeHandler, Arc<std::sync::Mutex<Vec<PathBuf>>>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = seen.clone();
        let handler: ChangeHandler = Arc::new(move |path: PathBuf| -> BoxFuture<'static, Result<()>> {
            record.lock().unwrap().push(path);
            Box::pin(async { Ok(()) })
        });
        (handler, seen)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watcher_fires_once_per_write_until_stopped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let file = root.join("automations.yaml");
        std::fs::write(&file, "- id: a1\n").unwrap();

        let (handler, seen) = recording_handler();
        let matcher = WatchMatcher::new(&root, &[WatchSelector::Config], false, false);
        let mut watcher = ChangeWatcher::start_with(matcher, Duration::from_millis(100), handler).unwrap();

        // Files that existed before start do not fire
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(seen.lock().unwrap().is_empty());

        std::fs::write(&file, "- id: a1\n  alias: Changed\n").unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(seen.lock().unwrap().clone(), vec![file.clone()]);

        watcher.stop().await;
        std::fs::write(&file, "- id: a1\n  alias: After stop\n").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_start_requires_history_mode() {
        let settings = Settings::default();
        assert!(matches!(
            ChangeWatcher::start(&settings),
            Err(TimeMachineError::InvalidInput(_))
        ));
    }
}
