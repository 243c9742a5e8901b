use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ignore::IgnoreClassifier;
use super::tree::SyncTree;

const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Add(PathBuf),
    Change(PathBuf),
    DeleteFile(PathBuf),
    DeleteDirectory(PathBuf),
    /// The initial scan finished.
    Ready,
    Error {
        path: Option<PathBuf>,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("cannot access {path}: {source}")]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    pub stability_threshold: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stability_threshold: Duration::from_millis(2000),
        }
    }
}

/// Polling watcher over a set of tracked roots. Add and change events fire
/// only after a file has kept the same size and mtime for the stability
/// threshold.
#[derive(Default)]
pub struct ChangeDetector {
    watchers: Vec<PollWatcher>,
    cancel: Option<CancellationToken>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Starts watching `roots`, replacing any previous session. A root that
    /// cannot be watched produces an `Error` event; the rest are still watched.
    /// Paths are filtered against the latest tracked tree published on `tree`.
    pub fn start(
        &mut self,
        roots: &[PathBuf],
        classifier: IgnoreClassifier,
        tree: watch::Receiver<SyncTree>,
        options: WatchOptions,
    ) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.stop();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut watched = Vec::new();
        for root in outermost(roots) {
            match watch_root(&root, raw_tx.clone(), options.poll_interval) {
                Ok(watcher) => {
                    debug!(root = %root.display(), "watching");
                    self.watchers.push(watcher);
                    watched.push(root);
                }
                Err(err) => {
                    warn!(root = %root.display(), error = %err, "failed to watch root");
                    if events_tx
                        .send(ChangeEvent::Error {
                            path: Some(root),
                            message: err.to_string(),
                        })
                        .is_err()
                    {
                        debug!("change receiver dropped before start finished");
                    }
                }
            }
        }
        drop(raw_tx);

        let cancel = CancellationToken::new();
        let pump = Pump {
            roots: watched,
            classifier,
            tree,
            stability: options.stability_threshold,
            known_dirs: HashSet::new(),
            announced: HashMap::new(),
            pending: HashMap::new(),
            events: events_tx,
        };
        let tick = options
            .poll_interval
            .min(options.stability_threshold / 2)
            .max(MIN_TICK);
        tokio::spawn(pump.run(raw_rx, tick, cancel.clone()));
        self.cancel = Some(cancel);
        events_rx
    }

    /// Releases every watch handle. Safe to call repeatedly or before `start`.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            info!(roots = self.watchers.len(), "watcher stopped");
        }
        self.watchers.clear();
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_root(
    root: &Path,
    raw_tx: mpsc::UnboundedSender<notify::Result<Event>>,
    poll_interval: Duration,
) -> Result<PollWatcher, WatchError> {
    // PollWatcher accepts missing paths silently; surface them here instead.
    std::fs::metadata(root).map_err(|source| WatchError::Inaccessible {
        path: root.to_path_buf(),
        source,
    })?;
    let notify_err = |source| WatchError::Notify {
        path: root.to_path_buf(),
        source,
    };
    let config = notify::Config::default().with_poll_interval(poll_interval);
    let mut watcher = PollWatcher::new(
        move |res: notify::Result<Event>| {
            if raw_tx.send(res).is_err() {
                debug!("watch pump gone; raw event dropped");
            }
        },
        config,
    )
    .map_err(notify_err)?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(notify_err)?;
    Ok(watcher)
}

/// Drops roots nested inside other roots.
fn outermost(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut sorted: Vec<&PathBuf> = roots.iter().collect();
    sorted.sort_by_key(|root| root.components().count());
    let mut kept: Vec<PathBuf> = Vec::new();
    for root in sorted {
        if !kept.iter().any(|outer| root.starts_with(outer)) {
            kept.push(root.clone());
        }
    }
    kept
}

type Fingerprint = (u64, Option<SystemTime>);

struct PendingWrite {
    fingerprint: Fingerprint,
    since: Instant,
}

struct Pump {
    roots: Vec<PathBuf>,
    classifier: IgnoreClassifier,
    tree: watch::Receiver<SyncTree>,
    stability: Duration,
    known_dirs: HashSet<PathBuf>,
    announced: HashMap<PathBuf, Fingerprint>,
    pending: HashMap<PathBuf, PendingWrite>,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

impl Pump {
    async fn run(
        mut self,
        mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
        tick: Duration,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.initial_scan() => {}
        }
        self.emit(ChangeEvent::Ready);

        let mut ticker = tokio::time::interval(tick);
        let mut raw_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = raw.recv(), if raw_open => match received {
                    Some(Ok(event)) => self.handle(event).await,
                    Some(Err(err)) => {
                        warn!(error = %err, "watch error");
                        self.emit(ChangeEvent::Error {
                            path: err.paths.first().cloned(),
                            message: err.to_string(),
                        });
                    }
                    None => raw_open = false,
                },
                _ = ticker.tick() => self.flush_stable().await,
            }
        }
        debug!("watch pump exited");
    }

    async fn initial_scan(&mut self) {
        let mut stack: Vec<PathBuf> = Vec::new();
        for root in self.roots.clone() {
            match tokio::fs::metadata(&root).await {
                Ok(meta) if meta.is_dir() => {
                    self.known_dirs.insert(root.clone());
                    stack.push(root);
                }
                Ok(meta) => {
                    if !self.is_filtered(&root, &root, false) {
                        self.track(root, fingerprint_of(&meta));
                    }
                }
                Err(err) => warn!(root = %root.display(), error = %err, "root vanished before scan"),
            }
        }

        while let Some(dir) = stack.pop() {
            let Some(root) = self.root_of(&dir).map(Path::to_path_buf) else {
                continue;
            };
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "failed to scan directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(meta) = tokio::fs::metadata(&path).await else {
                    continue;
                };
                if self.is_filtered(&root, &path, meta.is_dir()) {
                    continue;
                }
                if meta.is_dir() {
                    self.known_dirs.insert(path.clone());
                    stack.push(path);
                } else {
                    self.track(path, fingerprint_of(&meta));
                }
            }
        }
        debug!(
            files = self.pending.len(),
            dirs = self.known_dirs.len(),
            "initial scan complete"
        );
    }

    async fn handle(&mut self, event: Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in event.paths {
                    self.observe(path).await;
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.removed(path);
                }
            }
            _ => {}
        }
    }

    async fn observe(&mut self, path: PathBuf) {
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return;
        };
        let Some(root) = self.root_of(&path).map(Path::to_path_buf) else {
            return;
        };
        if self.is_filtered(&root, &path, meta.is_dir()) {
            return;
        }
        if meta.is_dir() {
            self.known_dirs.insert(path);
            return;
        }
        let fingerprint = fingerprint_of(&meta);
        if self.announced.get(&path) == Some(&fingerprint) && !self.pending.contains_key(&path) {
            return;
        }
        self.track(path, fingerprint);
    }

    fn removed(&mut self, path: PathBuf) {
        self.pending.remove(&path);
        if self.known_dirs.remove(&path) {
            self.emit(ChangeEvent::DeleteDirectory(path));
        } else if self.announced.remove(&path).is_some() {
            self.emit(ChangeEvent::DeleteFile(path));
        }
    }

    fn track(&mut self, path: PathBuf, fingerprint: Fingerprint) {
        match self.pending.get_mut(&path) {
            Some(pending) if pending.fingerprint == fingerprint => {}
            Some(pending) => {
                pending.fingerprint = fingerprint;
                pending.since = Instant::now();
            }
            None => {
                self.pending.insert(
                    path,
                    PendingWrite {
                        fingerprint,
                        since: Instant::now(),
                    },
                );
            }
        }
    }

    async fn flush_stable(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let paths: Vec<PathBuf> = self.pending.keys().cloned().collect();
        for path in paths {
            let current = match tokio::fs::metadata(&path).await {
                Ok(meta) => fingerprint_of(&meta),
                Err(_) => {
                    self.pending.remove(&path);
                    continue;
                }
            };
            let Some(pending) = self.pending.get_mut(&path) else {
                continue;
            };
            if pending.fingerprint != current {
                pending.fingerprint = current;
                pending.since = Instant::now();
                continue;
            }
            if pending.since.elapsed() < self.stability {
                continue;
            }
            self.pending.remove(&path);
            let event = match self.announced.insert(path.clone(), current) {
                Some(_) => ChangeEvent::Change(path),
                None => ChangeEvent::Add(path),
            };
            self.emit(event);
        }
    }

    fn root_of(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .find(|root| path.starts_with(root))
            .map(PathBuf::as_path)
    }

    fn is_filtered(&self, root: &Path, path: &Path, is_dir: bool) -> bool {
        self.tree
            .borrow()
            .is_path_ignored(&self.classifier, root, path, is_dir)
    }

    fn emit(&self, event: ChangeEvent) {
        if let Err(err) = self.events.send(event) {
            debug!(event = ?err.0, "change receiver dropped; event discarded");
        }
    }
}

fn fingerprint_of(meta: &std::fs::Metadata) -> Fingerprint {
    (meta.len(), meta.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn quick() -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(50),
            stability_threshold: Duration::from_millis(150),
        }
    }

    fn untracked() -> watch::Receiver<SyncTree> {
        watch::channel(SyncTree::new()).1
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<ChangeEvent>,
        seen: &mut Vec<ChangeEvent>,
        wanted: &ChangeEvent,
    ) {
        let found = timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                let done = &event == wanted;
                seen.push(event);
                if done {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(
            matches!(found, Ok(true)),
            "timed out waiting for {wanted:?}; saw {seen:?}"
        );
    }

    #[test]
    fn stop_is_safe_before_start_and_repeatable() {
        let mut detector = ChangeDetector::new();
        detector.stop();
        detector.stop();
        assert!(!detector.is_running());
    }

    #[test]
    fn nested_roots_collapse_to_outermost() {
        let roots = vec![
            PathBuf::from("/a/b"),
            PathBuf::from("/a"),
            PathBuf::from("/ab"),
        ];
        assert_eq!(
            outermost(&roots),
            vec![PathBuf::from("/a"), PathBuf::from("/ab")]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initial_scan_announces_only_tracked_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        std::fs::write(root.join("img.png"), "png").unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();

        let mut detector = ChangeDetector::new();
        let mut rx = detector.start(
            std::slice::from_ref(&root),
            IgnoreClassifier::default(),
            untracked(),
            quick(),
        );
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, &ChangeEvent::Add(root.join("a.txt"))).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        detector.stop();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }

        assert!(seen.contains(&ChangeEvent::Ready));
        let adds: Vec<_> = seen
            .iter()
            .filter(|event| matches!(event, ChangeEvent::Add(_)))
            .collect();
        assert_eq!(adds, vec![&ChangeEvent::Add(root.join("a.txt"))]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_changes_and_deletions() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let file = root.join("a.txt");
        std::fs::write(&file, "one").unwrap();

        let mut detector = ChangeDetector::new();
        let mut rx = detector.start(
            std::slice::from_ref(&root),
            IgnoreClassifier::default(),
            untracked(),
            quick(),
        );
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, &ChangeEvent::Add(file.clone())).await;

        std::fs::write(&file, "two, longer").unwrap();
        wait_for(&mut rx, &mut seen, &ChangeEvent::Change(file.clone())).await;

        let sub = root.join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("b.md"), "b").unwrap();
        wait_for(&mut rx, &mut seen, &ChangeEvent::Add(sub.join("b.md"))).await;

        std::fs::remove_file(&file).unwrap();
        wait_for(&mut rx, &mut seen, &ChangeEvent::DeleteFile(file.clone())).await;

        std::fs::remove_dir_all(&sub).unwrap();
        wait_for(&mut rx, &mut seen, &ChangeEvent::DeleteDirectory(sub.clone())).await;
        detector.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_root_does_not_stop_other_roots() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(good.join("a.txt"), "a").unwrap();
        let missing = dir.path().join("missing");

        let mut detector = ChangeDetector::new();
        let mut rx = detector.start(
            &[missing.clone(), good.clone()],
            IgnoreClassifier::default(),
            untracked(),
            quick(),
        );
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, &ChangeEvent::Add(good.join("a.txt"))).await;
        detector.stop();

        assert!(seen.iter().any(|event| matches!(
            event,
            ChangeEvent::Error { path: Some(path), .. } if path == &missing
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn add_waits_until_writes_settle() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let file = root.join("draft.md");
        let options = WatchOptions {
            poll_interval: Duration::from_millis(50),
            stability_threshold: Duration::from_millis(600),
        };

        let mut detector = ChangeDetector::new();
        let mut rx = detector.start(
            std::slice::from_ref(&root),
            IgnoreClassifier::default(),
            untracked(),
            options,
        );
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, &ChangeEvent::Ready).await;

        let mut content = String::new();
        let mut last_write = Instant::now();
        for _ in 0..10 {
            content.push_str("another line\n");
            std::fs::write(&file, &content).unwrap();
            last_write = Instant::now();
            tokio::time::sleep(Duration::from_millis(100)).await;
            while let Ok(event) = rx.try_recv() {
                assert_ne!(event, ChangeEvent::Add(file.clone()), "announced mid-write");
                seen.push(event);
            }
        }

        wait_for(&mut rx, &mut seen, &ChangeEvent::Add(file.clone())).await;
        assert!(last_write.elapsed() >= Duration::from_millis(500));
        detector.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follows_tree_updates_published_after_start() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let logo = root.join("logo.png");

        let (tree_tx, tree_rx) = watch::channel(SyncTree::new());
        let mut detector = ChangeDetector::new();
        let mut rx = detector.start(
            std::slice::from_ref(&root),
            IgnoreClassifier::default(),
            tree_rx,
            quick(),
        );
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, &ChangeEvent::Ready).await;

        let mut tree = SyncTree::from_items(
            serde_json::from_value(serde_json::json!([{
                "name": "root",
                "path": root,
                "isDirectory": true,
                "children": [{
                    "name": "logo.png",
                    "path": logo,
                    "isDirectory": false,
                    "ignored": true,
                    "ignoreReason": "extension",
                    "ownReason": "extension"
                }]
            }]))
            .unwrap(),
        );
        tree.set_ignored(&logo, false);
        tree_tx.send_replace(tree);

        std::fs::write(&logo, [0u8; 8]).unwrap();
        wait_for(&mut rx, &mut seen, &ChangeEvent::Add(logo.clone())).await;
        detector.stop();
    }
}
