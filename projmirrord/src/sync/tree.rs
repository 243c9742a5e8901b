use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ignore::{IgnoreClassifier, IgnoreReason, IgnoreStatus};

/// Nested, serializable form of a tracked item. This is what the store persists
/// and what the presentation side exchanges with the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub name: String,
    pub path: PathBuf,
    pub is_directory: bool,
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub ignore_reason: IgnoreReason,
    #[serde(default, skip_serializing_if = "IgnoreReason::is_none")]
    pub own_reason: IgnoreReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SyncItem>,
}

impl SyncItem {
    fn from_status(path: &Path, is_directory: bool, status: IgnoreStatus) -> Self {
        Self {
            name: file_name_of(path),
            path: path.to_path_buf(),
            is_directory,
            ignored: status.ignored,
            ignore_reason: status.reason,
            own_reason: status.reason,
            children: Vec::new(),
        }
    }

    /// The item's own verdict, recovering it from older data that only
    /// carried `ignoreReason`.
    fn effective_own_reason(&self) -> IgnoreReason {
        if !self.own_reason.is_none() {
            return self.own_reason;
        }
        match self.ignore_reason {
            IgnoreReason::ParentIgnored => IgnoreReason::None,
            IgnoreReason::None if self.ignored => IgnoreReason::Manual,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    name: String,
    path: PathBuf,
    is_dir: bool,
    own: IgnoreReason,
    inherited: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl TreeNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn is_ignored(&self) -> bool {
        self.inherited || !self.own.is_none()
    }

    pub fn ignore_reason(&self) -> IgnoreReason {
        if self.inherited {
            IgnoreReason::ParentIgnored
        } else {
            self.own
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Tracked items held in an arena. Node ids stay valid until the node is
/// removed; removed slots are never reused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncTree {
    nodes: Vec<Option<TreeNode>>,
    roots: Vec<NodeId>,
    index: HashMap<PathBuf, NodeId>,
    /// Items removed from inside a tracked directory. They stay out of sync
    /// until selected again.
    removed: BTreeSet<PathBuf>,
}

impl SyncTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<SyncItem>) -> Self {
        let mut tree = Self::new();
        for item in items {
            let id = tree.alloc_subtree(item, None);
            tree.roots.push(id);
            tree.refresh_inherited(id);
        }
        tree
    }

    pub fn to_items(&self) -> Vec<SyncItem> {
        let order = self.preorder(&self.roots);
        let mut built: HashMap<NodeId, SyncItem> = HashMap::with_capacity(order.len());
        for id in order.into_iter().rev() {
            let Some(node) = self.node(id) else {
                continue;
            };
            let children = node
                .children
                .iter()
                .filter_map(|child| built.remove(child))
                .collect();
            built.insert(
                id,
                SyncItem {
                    name: node.name.clone(),
                    path: node.path.clone(),
                    is_directory: node.is_dir,
                    ignored: node.is_ignored(),
                    ignore_reason: node.ignore_reason(),
                    own_reason: node.own,
                    children,
                },
            );
        }
        self.roots
            .iter()
            .filter_map(|id| built.remove(id))
            .collect()
    }

    pub fn with_removed(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.removed.extend(paths);
        self
    }

    pub fn removed_paths(&self) -> Vec<PathBuf> {
        self.removed.iter().cloned().collect()
    }

    /// True when `path` or one of its ancestors was removed by the user.
    pub fn is_removed(&self, path: &Path) -> bool {
        self.removed.iter().any(|removed| path.starts_with(removed))
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn find(&self, path: &Path) -> Option<NodeId> {
        self.index.get(path).copied()
    }

    pub fn get(&self, path: &Path) -> Option<&TreeNode> {
        self.find(path).and_then(|id| self.node(id))
    }

    /// Integrates freshly built items. An item whose path is already tracked is
    /// skipped; one nested under a tracked top-level directory becomes a child
    /// of the first such root; anything else becomes a new root.
    pub fn merge(&mut self, items: Vec<SyncItem>) {
        for item in items {
            self.removed.retain(|removed| !removed.starts_with(&item.path));
            if self.index.contains_key(&item.path) {
                debug!(path = %item.path.display(), "merge: already tracked");
                continue;
            }
            let parent = self
                .roots
                .iter()
                .copied()
                .find(|id| {
                    self.node(*id).is_some_and(|root| {
                        root.is_dir && is_proper_ancestor(&root.path, &item.path)
                    })
                });
            let id = self.alloc_subtree(item, parent);
            match parent {
                Some(parent) => self.push_child(parent, id),
                None => self.roots.push(id),
            }
            self.absorb_nested(id);
            self.refresh_inherited(id);
        }
    }

    /// Sets or clears a manual ignore on `path`. Descendants inherit
    /// `parent_ignored` while any ancestor is ignored; their own verdicts are
    /// kept underneath and resurface when the ancestor is cleared.
    pub fn set_ignored(&mut self, path: &Path, ignored: bool) -> Option<NodeId> {
        let id = self.find(path)?;
        let node = self.node_mut(id)?;
        node.own = if ignored {
            IgnoreReason::Manual
        } else {
            IgnoreReason::None
        };
        self.refresh_inherited(id);
        Some(id)
    }

    /// Removes the item at `path` with its subtree. A nested item is
    /// remembered so that the enclosing directory no longer covers it.
    pub fn remove(&mut self, path: &Path) -> bool {
        let Some(id) = self.find(path) else {
            return false;
        };
        let nested = self.node(id).is_some_and(|node| node.parent.is_some());
        self.removed.retain(|removed| !removed.starts_with(path));
        if nested {
            self.removed.insert(path.to_path_buf());
        }
        self.detach(id);
        self.free_subtree(id);
        true
    }

    /// Records a file that appeared under a tracked directory after
    /// selection, adding the directories in between. Returns false when the
    /// path is already tracked or has no tracked directory above it.
    pub fn track_discovered(&mut self, path: &Path) -> bool {
        if self.index.contains_key(path) {
            return false;
        }
        let Some((anchor, anchor_path)) = path
            .ancestors()
            .skip(1)
            .find_map(|dir| self.find(dir).map(|id| (id, dir.to_path_buf())))
        else {
            return false;
        };
        if !self.node(anchor).is_some_and(TreeNode::is_dir) {
            return false;
        }

        let mut missing: Vec<PathBuf> = path
            .ancestors()
            .take_while(|dir| *dir != anchor_path.as_path())
            .map(Path::to_path_buf)
            .collect();
        missing.reverse();
        let count = missing.len();
        let mut parent = anchor;
        for (position, current) in missing.into_iter().enumerate() {
            let id = NodeId(self.nodes.len());
            self.nodes.push(Some(TreeNode {
                name: file_name_of(&current),
                path: current.clone(),
                is_dir: position + 1 < count,
                own: IgnoreReason::None,
                inherited: false,
                parent: Some(parent),
                children: Vec::new(),
            }));
            self.index.insert(current, id);
            self.push_child(parent, id);
            parent = id;
        }
        debug!(path = %path.display(), added = count, "tracked new file");
        self.refresh_inherited(anchor);
        true
    }

    /// Top-level paths that are not ignored; these are handed to the watcher.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        self.roots
            .iter()
            .filter_map(|id| self.node(*id))
            .filter(|node| !node.is_ignored())
            .map(|node| node.path.clone())
            .collect()
    }

    /// True when the closest tracked item at or above `path` is ignored.
    pub fn is_excluded(&self, path: &Path) -> bool {
        path.ancestors()
            .find_map(|candidate| self.get(candidate))
            .is_some_and(TreeNode::is_ignored)
    }

    /// Whether a path under the watched `root` stays out of sync. A tracked
    /// item's own state decides; a removed item is always out; anything else
    /// takes the nearest tracked ancestor's state and then the classifier.
    pub fn is_path_ignored(
        &self,
        classifier: &IgnoreClassifier,
        root: &Path,
        path: &Path,
        is_dir: bool,
    ) -> bool {
        if let Some(node) = self.get(path) {
            return node.is_ignored();
        }
        if self.is_removed(path) || self.is_excluded(path) {
            return true;
        }
        let base = path
            .ancestors()
            .skip(1)
            .find(|dir| self.index.contains_key(*dir))
            .unwrap_or(root);
        classifier.is_excluded_below(base, path) || classifier.classify_entry(path, is_dir).ignored
    }

    /// Non-ignored files at or below `path`.
    pub fn files_under(&self, path: &Path) -> Vec<PathBuf> {
        let Some(id) = self.find(path) else {
            return Vec::new();
        };
        self.preorder(&[id])
            .into_iter()
            .filter_map(|id| self.node(id))
            .filter(|node| !node.is_dir && !node.is_ignored())
            .map(|node| node.path.clone())
            .collect()
    }

    /// All files at or below `path`, ignored or not.
    pub fn all_files_under(&self, path: &Path) -> Vec<PathBuf> {
        let Some(id) = self.find(path) else {
            return Vec::new();
        };
        self.preorder(&[id])
            .into_iter()
            .filter_map(|id| self.node(id))
            .filter(|node| !node.is_dir)
            .map(|node| node.path.clone())
            .collect()
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    fn preorder(&self, start: &[NodeId]) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = start.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            out.push(id);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    fn alloc_subtree(&mut self, item: SyncItem, parent: Option<NodeId>) -> NodeId {
        let mut stack = vec![(item, parent)];
        let mut top = None;
        while let Some((mut item, parent)) = stack.pop() {
            let id = NodeId(self.nodes.len());
            let children = std::mem::take(&mut item.children);
            self.nodes.push(Some(TreeNode {
                own: item.effective_own_reason(),
                name: item.name,
                path: item.path.clone(),
                is_dir: item.is_directory,
                inherited: false,
                parent,
                children: Vec::new(),
            }));
            self.index.entry(item.path).or_insert(id);
            match (top, parent) {
                (None, _) => top = Some(id),
                (Some(_), Some(parent)) => self.push_child(parent, id),
                (Some(_), None) => {}
            }
            stack.extend(children.into_iter().rev().map(|child| (child, Some(id))));
        }
        top.unwrap_or(NodeId(self.nodes.len()))
    }

    fn push_child(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.node_mut(parent) {
            node.children.push(child);
        }
    }

    fn refresh_inherited(&mut self, from: NodeId) {
        let parent_ignored = self
            .node(from)
            .and_then(|node| node.parent)
            .and_then(|parent| self.node(parent))
            .is_some_and(TreeNode::is_ignored);
        if let Some(node) = self.node_mut(from) {
            node.inherited = parent_ignored;
        }
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            let ignored = node.is_ignored();
            let children = node.children.clone();
            for child in children {
                if let Some(child_node) = self.node_mut(child) {
                    child_node.inherited = ignored;
                    stack.push(child);
                }
            }
        }
    }

    fn detach(&mut self, id: NodeId) {
        let parent = self.node(id).and_then(|node| node.parent);
        match parent {
            Some(parent) => {
                if let Some(node) = self.node_mut(parent) {
                    node.children.retain(|child| *child != id);
                }
            }
            None => self.roots.retain(|root| *root != id),
        }
        if let Some(node) = self.node_mut(id) {
            node.parent = None;
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        for freed in self.preorder(&[id]) {
            if let Some(node) = self.nodes.get_mut(freed.0).and_then(Option::take)
                && self.index.get(&node.path) == Some(&freed)
            {
                self.index.remove(&node.path);
            }
        }
    }

    /// Moves tracked items that live below the newly attached `new_id` into its
    /// subtree, replacing the freshly built node at the same path so that their
    /// ignore state survives.
    fn absorb_nested(&mut self, new_id: NodeId) {
        let Some(new_path) = self.node(new_id).map(|node| node.path.clone()) else {
            return;
        };
        let fresh: HashSet<NodeId> = self.preorder(&[new_id]).into_iter().collect();
        let mut candidates: Vec<(usize, NodeId)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let node = slot.as_ref()?;
                let id = NodeId(idx);
                (!fresh.contains(&id) && is_proper_ancestor(&new_path, &node.path))
                    .then(|| (node.path.components().count(), id))
            })
            .collect();
        candidates.sort();

        for (_, existing) in candidates {
            if self.is_within(existing, new_id) {
                continue;
            }
            let Some(existing_path) = self.node(existing).map(|node| node.path.clone()) else {
                continue;
            };
            debug!(path = %existing_path.display(), "merge: re-parenting tracked item");
            self.detach(existing);

            let subtree = self.preorder(&[new_id]);
            let duplicate = subtree.iter().copied().find(|id| {
                *id != existing
                    && self
                        .node(*id)
                        .is_some_and(|node| node.path == existing_path)
            });
            match duplicate.and_then(|dup| self.node(dup).and_then(|n| n.parent).map(|p| (dup, p)))
            {
                Some((duplicate, parent)) => {
                    if let Some(parent_node) = self.node_mut(parent)
                        && let Some(slot) = parent_node
                            .children
                            .iter_mut()
                            .find(|child| **child == duplicate)
                    {
                        *slot = existing;
                    }
                    if let Some(dup_node) = self.node_mut(duplicate) {
                        dup_node.parent = None;
                    }
                    self.free_subtree(duplicate);
                    if let Some(node) = self.node_mut(existing) {
                        node.parent = Some(parent);
                    }
                }
                None => {
                    let parent = subtree
                        .iter()
                        .copied()
                        .filter(|id| {
                            self.node(*id).is_some_and(|node| {
                                node.is_dir && is_proper_ancestor(&node.path, &existing_path)
                            })
                        })
                        .max_by_key(|id| self.node(*id).map(|n| n.path.components().count()))
                        .unwrap_or(new_id);
                    self.push_child(parent, existing);
                    if let Some(node) = self.node_mut(existing) {
                        node.parent = Some(parent);
                    }
                }
            }
            for id in self.preorder(&[existing]) {
                if let Some(path) = self.node(id).map(|node| node.path.clone()) {
                    self.index.insert(path, id);
                }
            }
        }
    }

    fn is_within(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.node(current).and_then(|node| node.parent);
        }
        false
    }
}

/// Stats `path` and builds its item, listing directories with an explicit
/// work stack. Entries that vanish mid-scan are skipped.
pub async fn build_item(path: &Path, classifier: &IgnoreClassifier) -> io::Result<SyncItem> {
    let metadata = tokio::fs::metadata(path).await?;
    let is_dir = metadata.is_dir();
    let mut root = SyncItem::from_status(path, is_dir, classifier.classify_entry(path, is_dir));
    if !is_dir {
        return Ok(root);
    }

    let mut listings: HashMap<PathBuf, Vec<SyncItem>> = HashMap::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "failed to list directory");
                continue;
            }
        };
        let mut children = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "directory listing interrupted");
                    break;
                }
            };
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            let child_path = entry.path();
            let child_is_dir = file_type.is_dir();
            if child_is_dir {
                pending.push(child_path.clone());
            }
            children.push(SyncItem::from_status(
                &child_path,
                child_is_dir,
                classifier.classify_entry(&child_path, child_is_dir),
            ));
        }
        listings.insert(dir, children);
    }

    let mut dirs: Vec<PathBuf> = listings.keys().cloned().collect();
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        if dir == path {
            continue;
        }
        let Some(children) = listings.remove(&dir) else {
            continue;
        };
        let Some(siblings) = dir.parent().and_then(|parent| listings.get_mut(parent)) else {
            continue;
        };
        if let Some(item) = siblings.iter_mut().find(|item| item.path == dir) {
            item.children = children;
        }
    }
    root.children = listings.remove(path).unwrap_or_default();
    apply_inherited(&mut root);
    Ok(root)
}

/// Builds items for each selected path, skipping paths that cannot be read.
pub async fn build_items(paths: &[PathBuf], classifier: &IgnoreClassifier) -> Vec<SyncItem> {
    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        match build_item(path, classifier).await {
            Ok(item) => items.push(item),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable selection"),
        }
    }
    items
}

fn apply_inherited(root: &mut SyncItem) {
    let mut stack: Vec<(&mut SyncItem, bool)> = vec![(root, false)];
    while let Some((item, parent_ignored)) = stack.pop() {
        if parent_ignored {
            item.ignored = true;
            item.ignore_reason = IgnoreReason::ParentIgnored;
        }
        let ignored = item.ignored;
        for child in item.children.iter_mut() {
            stack.push((child, ignored));
        }
    }
}

fn is_proper_ancestor(ancestor: &Path, path: &Path) -> bool {
    path != ancestor && path.starts_with(ancestor)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
#[path = "tree_tests.rs"]
mod tests;
