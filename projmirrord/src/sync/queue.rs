use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::engine::SyncError;
use super::roots::lexical_clean;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Add,
    Change,
    Delete,
}

/// One unit of synchronization work. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub organization_id: String,
    pub project_id: String,
    pub file_path: PathBuf,
    pub sync_root: PathBuf,
    pub kind: TaskKind,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sync queue is closed")]
    Closed,
}

pub trait TaskProcessor: Send + Sync + 'static {
    fn process(&self, task: SyncTask) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// Per-path mailboxes drained by a bounded set of workers. Tasks for one path
/// run one at a time in arrival order; distinct paths run concurrently.
pub struct SyncQueue {
    intake: Option<mpsc::UnboundedSender<SyncTask>>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl SyncQueue {
    pub fn new<P: TaskProcessor>(processor: Arc<P>, workers: usize) -> Self {
        let (intake, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(
            processor,
            rx,
            workers.max(1),
            cancel.clone(),
            pending.clone(),
        ));
        Self {
            intake: Some(intake),
            pending,
            cancel,
            dispatcher: Some(dispatcher),
        }
    }

    /// Accepts a task without waiting for it to run.
    pub fn add(&self, task: SyncTask) -> Result<(), QueueError> {
        let intake = self.intake.as_ref().ok_or(QueueError::Closed)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        intake.send(task).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            QueueError::Closed
        })
    }

    /// Accepted tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stops intake and waits until every accepted task has run.
    pub async fn shutdown(mut self) {
        self.intake.take();
        if let Some(dispatcher) = self.dispatcher.take()
            && let Err(err) = dispatcher.await
        {
            error!(error = %err, "sync queue dispatcher failed");
        }
    }
}

impl Drop for SyncQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch<P: TaskProcessor>(
    processor: Arc<P>,
    mut intake: mpsc::UnboundedReceiver<SyncTask>,
    workers: usize,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
) {
    let mut mailboxes: HashMap<PathBuf, VecDeque<SyncTask>> = HashMap::new();
    let mut in_flight: HashSet<PathBuf> = HashSet::new();
    let mut ready: VecDeque<PathBuf> = VecDeque::new();
    let mut running: JoinSet<PathBuf> = JoinSet::new();
    let mut intake_open = true;

    loop {
        while running.len() < workers
            && let Some(key) = ready.pop_front()
        {
            let Some(task) = mailboxes.get_mut(&key).and_then(VecDeque::pop_front) else {
                continue;
            };
            in_flight.insert(key.clone());
            running.spawn(run_task(processor.clone(), key, task));
        }

        if !intake_open && running.is_empty() {
            debug!("sync queue drained");
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(in_flight = running.len(), "sync queue torn down");
                break;
            }
            received = intake.recv(), if intake_open => match received {
                Some(task) => {
                    let key = lexical_clean(&task.file_path);
                    let mailbox = mailboxes.entry(key.clone()).or_default();
                    mailbox.push_back(task);
                    if mailbox.len() == 1 && !in_flight.contains(&key) {
                        ready.push_back(key);
                    }
                }
                None => intake_open = false,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                pending.fetch_sub(1, Ordering::SeqCst);
                let key = match joined {
                    Ok(key) => key,
                    Err(err) => {
                        error!(error = %err, "sync worker aborted");
                        continue;
                    }
                };
                in_flight.remove(&key);
                if mailboxes.get(&key).is_some_and(|mailbox| !mailbox.is_empty()) {
                    ready.push_back(key);
                } else {
                    mailboxes.remove(&key);
                }
            }
        }
    }
}

async fn run_task<P: TaskProcessor>(processor: Arc<P>, key: PathBuf, task: SyncTask) -> PathBuf {
    let kind = task.kind;
    match AssertUnwindSafe(processor.process(task)).catch_unwind().await {
        Ok(Ok(())) => debug!(path = %key.display(), ?kind, "task done"),
        Ok(Err(err)) => warn!(path = %key.display(), ?kind, error = %err, "task failed"),
        Err(_) => error!(path = %key.display(), ?kind, "task panicked"),
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::paths::PathError;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(PathBuf, TaskKind)>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<(PathBuf, TaskKind)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl TaskProcessor for Recorder {
        async fn process(&self, task: SyncTask) -> Result<(), SyncError> {
            let name = task.file_path.to_string_lossy().into_owned();
            if task.kind == TaskKind::Add {
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
            if name.ends_with("panic.txt") && task.kind == TaskKind::Add {
                panic!("processor blew up");
            }
            self.seen
                .lock()
                .unwrap()
                .push((task.file_path.clone(), task.kind));
            if name.ends_with("fail.txt") {
                return Err(SyncError::Path(PathError::UnsupportedComponent));
            }
            Ok(())
        }
    }

    fn task(path: &str, kind: TaskKind) -> SyncTask {
        SyncTask {
            organization_id: "org".into(),
            project_id: "project".into(),
            file_path: PathBuf::from(path),
            sync_root: PathBuf::from("/r"),
            kind,
        }
    }

    #[tokio::test]
    async fn same_path_tasks_run_in_arrival_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = SyncQueue::new(recorder.clone(), 4);

        queue.add(task("/r/a.txt", TaskKind::Add)).unwrap();
        queue.add(task("/r/a.txt", TaskKind::Delete)).unwrap();
        queue.add(task("/r/b.txt", TaskKind::Delete)).unwrap();
        queue.shutdown().await;

        let seen = recorder.seen();
        let for_a: Vec<_> = seen
            .iter()
            .filter(|(path, _)| path == Path::new("/r/a.txt"))
            .map(|(_, kind)| *kind)
            .collect();
        assert_eq!(for_a, vec![TaskKind::Add, TaskKind::Delete]);
        // b.txt is independent and finishes before a.txt's slow add.
        assert_eq!(seen[0], (PathBuf::from("/r/b.txt"), TaskKind::Delete));
    }

    #[tokio::test]
    async fn failing_task_does_not_block_other_paths() {
        let recorder = Arc::new(Recorder::default());
        let queue = SyncQueue::new(recorder.clone(), 1);

        queue.add(task("/r/fail.txt", TaskKind::Change)).unwrap();
        queue.add(task("/r/ok.txt", TaskKind::Change)).unwrap();
        queue.add(task("/r/fail.txt", TaskKind::Delete)).unwrap();
        queue.shutdown().await;

        assert_eq!(
            recorder.seen(),
            vec![
                (PathBuf::from("/r/fail.txt"), TaskKind::Change),
                (PathBuf::from("/r/ok.txt"), TaskKind::Change),
                (PathBuf::from("/r/fail.txt"), TaskKind::Delete),
            ]
        );
    }

    #[tokio::test]
    async fn panicking_task_releases_its_path() {
        let recorder = Arc::new(Recorder::default());
        let queue = SyncQueue::new(recorder.clone(), 2);

        queue.add(task("/r/panic.txt", TaskKind::Add)).unwrap();
        queue.add(task("/r/panic.txt", TaskKind::Delete)).unwrap();
        queue.shutdown().await;

        assert_eq!(
            recorder.seen(),
            vec![(PathBuf::from("/r/panic.txt"), TaskKind::Delete)]
        );
    }

    #[tokio::test]
    async fn pending_counts_unfinished_tasks() {
        let recorder = Arc::new(Recorder::default());
        let queue = SyncQueue::new(recorder.clone(), 2);

        queue.add(task("/r/a.txt", TaskKind::Add)).unwrap();
        queue.add(task("/r/a.txt", TaskKind::Change)).unwrap();
        assert_eq!(queue.pending(), 2);

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(recorder.seen().len(), 2);
    }
}
