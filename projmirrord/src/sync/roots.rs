use std::path::{Component, Path, PathBuf};

use super::tree::SyncTree;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoot {
    pub sync_root: PathBuf,
    pub root_folder_name: String,
}

/// Maps a path to the tracked top-level root that encloses it.
pub struct SyncRootResolver<'a> {
    tree: &'a SyncTree,
}

impl<'a> SyncRootResolver<'a> {
    pub fn new(tree: &'a SyncTree) -> Self {
        Self { tree }
    }

    /// Returns the first root, in tree order, that equals `path` or contains it.
    /// Matching is by whole path segments, so `/a/b` does not claim `/a/bc`.
    pub fn resolve(&self, path: &Path) -> Option<ResolvedRoot> {
        let query = normalize_for_compare(path);
        self.tree
            .roots()
            .iter()
            .filter_map(|id| self.tree.node(*id))
            .find(|root| is_segment_prefix(&normalize_for_compare(root.path()), &query))
            .map(|root| ResolvedRoot {
                sync_root: root.path().to_path_buf(),
                root_folder_name: root.name().to_string(),
            })
    }
}

/// Separator, `.`/`..` and casing normalization used for root comparison.
pub fn normalize_for_compare(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut normalized = parts.join("/");
    if raw.starts_with('/') {
        normalized.insert(0, '/');
    }
    if cfg!(any(target_os = "windows", target_os = "macos")) {
        normalized = normalized.to_lowercase();
    }
    normalized
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_segment_prefix(root: &str, query: &str) -> bool {
    if query == root {
        return true;
    }
    match query.strip_prefix(root) {
        Some(rest) => root.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ignore::IgnoreStatus;
    use crate::sync::tree::SyncItem;

    fn tree_with_roots(roots: &[(&str, bool)]) -> SyncTree {
        let items = roots
            .iter()
            .map(|(path, is_directory)| SyncItem {
                name: Path::new(path)
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned(),
                path: PathBuf::from(path),
                is_directory: *is_directory,
                ignored: IgnoreStatus::INCLUDED.ignored,
                ignore_reason: IgnoreStatus::INCLUDED.reason,
                own_reason: IgnoreStatus::INCLUDED.reason,
                children: Vec::new(),
            })
            .collect();
        SyncTree::from_items(items)
    }

    #[test]
    fn resolves_file_under_root() {
        let tree = tree_with_roots(&[("/proj/a", true)]);
        let resolved = SyncRootResolver::new(&tree)
            .resolve(Path::new("/proj/a/b.txt"))
            .unwrap();
        assert_eq!(resolved.sync_root, PathBuf::from("/proj/a"));
        assert_eq!(resolved.root_folder_name, "a");
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_matched() {
        let tree = tree_with_roots(&[("/a/b", true)]);
        let resolver = SyncRootResolver::new(&tree);
        assert_eq!(resolver.resolve(Path::new("/a/bc/x.txt")), None);
        assert!(resolver.resolve(Path::new("/a/b")).is_some());
    }

    #[test]
    fn first_matching_root_wins() {
        let tree = tree_with_roots(&[("/notes.md", false), ("/work", true), ("/work2", true)]);
        let resolver = SyncRootResolver::new(&tree);
        let resolved = resolver.resolve(Path::new("/work2/x.rs")).unwrap();
        assert_eq!(resolved.sync_root, PathBuf::from("/work2"));
        let file_root = resolver.resolve(Path::new("/notes.md")).unwrap();
        assert_eq!(file_root.root_folder_name, "notes.md");
    }

    #[test]
    fn query_is_normalized_before_matching() {
        let tree = tree_with_roots(&[("/proj/a", true)]);
        let resolved = SyncRootResolver::new(&tree)
            .resolve(Path::new("/proj//x/../a/./b.txt"))
            .unwrap();
        assert_eq!(resolved.sync_root, PathBuf::from("/proj/a"));
    }

    #[test]
    fn normalization_handles_separators() {
        assert_eq!(normalize_for_compare(Path::new("/a/b/")), "/a/b");
        assert_eq!(normalize_for_compare(Path::new("a\\b\\c")), "a/b/c");
        assert_eq!(normalize_for_compare(Path::new("/")), "/");
        assert!(is_segment_prefix("/", "/x"));
    }

    #[test]
    fn lexical_clean_drops_dot_segments() {
        assert_eq!(
            lexical_clean(Path::new("/r/./sub/../a.txt")),
            PathBuf::from("/r/a.txt")
        );
    }
}
