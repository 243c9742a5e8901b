use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// Names and `*suffix` patterns excluded from tracking.
pub const DEFAULT_IGNORE_LIST: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    ".DS_Store",
    "Thumbs.db",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".idea",
    ".vscode",
    "target",
    "dist",
    "*.log",
    "*.tmp",
    "*.swp",
    "*~",
];

/// Lower-case file extensions (with the leading dot) that are tracked.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".rst", ".csv", ".json", ".yaml", ".yml", ".toml", ".ini", ".cfg", ".xml",
    ".html", ".css", ".scss", ".js", ".jsx", ".ts", ".tsx", ".vue", ".svelte", ".py", ".rb",
    ".php", ".java", ".kt", ".swift", ".go", ".rs", ".c", ".h", ".cpp", ".hpp", ".cs", ".sh",
    ".sql", ".lua", ".r", ".tex",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    IgnoreList,
    Extension,
    Manual,
    ParentIgnored,
    #[default]
    None,
}

impl IgnoreReason {
    pub fn is_none(&self) -> bool {
        matches!(self, IgnoreReason::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoreStatus {
    pub ignored: bool,
    pub reason: IgnoreReason,
}

impl IgnoreStatus {
    pub const INCLUDED: IgnoreStatus = IgnoreStatus {
        ignored: false,
        reason: IgnoreReason::None,
    };

    fn ignored(reason: IgnoreReason) -> Self {
        Self {
            ignored: true,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NamePattern {
    Exact(String),
    Suffix(String),
}

impl NamePattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw.strip_prefix('*') {
            Some(suffix) => NamePattern::Suffix(suffix.to_string()),
            None => NamePattern::Exact(raw.to_string()),
        })
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(exact) => name == exact,
            NamePattern::Suffix(suffix) => name.ends_with(suffix.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreClassifier {
    patterns: Vec<NamePattern>,
    allowed_extensions: Vec<String>,
}

impl Default for IgnoreClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_LIST, DEFAULT_ALLOWED_EXTENSIONS)
    }
}

impl IgnoreClassifier {
    pub fn new<P, E>(ignore_list: &[P], allowed_extensions: &[E]) -> Self
    where
        P: AsRef<str>,
        E: AsRef<str>,
    {
        Self {
            patterns: ignore_list
                .iter()
                .filter_map(|p| NamePattern::parse(p.as_ref()))
                .collect(),
            allowed_extensions: allowed_extensions
                .iter()
                .map(|ext| normalize_extension(ext.as_ref()))
                .filter(|ext| ext.len() > 1)
                .collect(),
        }
    }

    /// Classifies a path on disk. A vanished path is classified as a file.
    pub fn classify(&self, path: &Path) -> IgnoreStatus {
        self.classify_entry(path, path.is_dir())
    }

    pub fn classify_entry(&self, path: &Path, is_dir: bool) -> IgnoreStatus {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return IgnoreStatus::INCLUDED;
        };
        if self.matches_name(&name) {
            return IgnoreStatus::ignored(IgnoreReason::IgnoreList);
        }
        if is_dir {
            return IgnoreStatus::INCLUDED;
        }
        let extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if !self.allowed_extensions.contains(&extension) {
            return IgnoreStatus::ignored(IgnoreReason::Extension);
        }
        IgnoreStatus::INCLUDED
    }

    /// True when a directory between `root` (exclusive) and `path` (exclusive)
    /// matches the name list.
    pub fn is_excluded_below(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let mut components: Vec<_> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect();
        components.pop();
        components.iter().any(|name| self.matches_name(name))
    }

    fn matches_name(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(name))
    }
}

fn normalize_extension(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.starts_with('.') {
        trimmed
    } else {
        format!(".{trimmed}")
    }
}
