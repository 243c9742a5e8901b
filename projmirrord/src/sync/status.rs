use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Queued,
    Syncing,
    Error,
}

impl SyncStatus {
    /// Aggregation order: error > syncing > queued > synced.
    fn priority(self) -> u8 {
        match self {
            SyncStatus::Synced => 0,
            SyncStatus::Queued => 1,
            SyncStatus::Syncing => 2,
            SyncStatus::Error => 3,
        }
    }

    pub fn is_outstanding(self) -> bool {
        matches!(self, SyncStatus::Queued | SyncStatus::Syncing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSummary {
    Remaining(usize),
    Watching,
    Stopped,
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncSummary::Remaining(count) => write!(f, "Syncing... {count} file(s) remaining"),
            SyncSummary::Watching => f.write_str("All files synced. Watching for changes..."),
            SyncSummary::Stopped => f.write_str("Sync stopped"),
        }
    }
}

/// Per-path sync status with directory roll-up.
#[derive(Debug, Default)]
pub struct StatusReconciler {
    leaves: BTreeMap<PathBuf, SyncStatus>,
    aggregated: HashMap<PathBuf, SyncStatus>,
    outstanding: usize,
    watching: bool,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a leaf status and recomputes every ancestor. Returns the
    /// ancestors whose aggregated status changed.
    pub fn update(&mut self, path: &Path, status: SyncStatus) -> Vec<(PathBuf, SyncStatus)> {
        let previous = self.leaves.insert(path.to_path_buf(), status);
        if previous.is_some_and(SyncStatus::is_outstanding) {
            self.outstanding -= 1;
        }
        if status.is_outstanding() {
            self.outstanding += 1;
        }

        let mut changed = Vec::new();
        for ancestor in path.ancestors().skip(1) {
            let Some(rolled_up) = self.roll_up(ancestor) else {
                continue;
            };
            if self.aggregated.insert(ancestor.to_path_buf(), rolled_up) != Some(rolled_up) {
                changed.push((ancestor.to_path_buf(), rolled_up));
            }
        }
        changed
    }

    pub fn status_of(&self, path: &Path) -> Option<SyncStatus> {
        self.leaves
            .get(path)
            .or_else(|| self.aggregated.get(path))
            .copied()
    }

    pub fn remaining(&self) -> usize {
        self.outstanding
    }

    pub fn set_watching(&mut self, watching: bool) {
        self.watching = watching;
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    pub fn summary(&self) -> SyncSummary {
        if !self.watching {
            SyncSummary::Stopped
        } else if self.outstanding > 0 {
            SyncSummary::Remaining(self.outstanding)
        } else {
            SyncSummary::Watching
        }
    }

    pub fn clear(&mut self) {
        self.leaves.clear();
        self.aggregated.clear();
        self.outstanding = 0;
    }

    fn roll_up(&self, dir: &Path) -> Option<SyncStatus> {
        // Paths order component-wise, so a directory's descendants are contiguous.
        self.leaves
            .range(dir.to_path_buf()..)
            .take_while(|(path, _)| path.starts_with(dir))
            .filter(|(path, _)| path.as_path() != dir)
            .map(|(_, status)| *status)
            .max_by_key(|status| status.priority())
    }
}
