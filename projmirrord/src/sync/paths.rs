use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::roots::lexical_clean;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("sync root {0} has no folder name")]
    NoRootName(PathBuf),
    #[error("{path} is not inside sync root {root}")]
    OutsideRoot { root: PathBuf, path: PathBuf },
    #[error("path contains unsupported component")]
    UnsupportedComponent,
}

/// Remote name of `file_path`: `<root folder name>/<path relative to root>`,
/// always joined with `/`. A root that is itself the file maps to its name.
pub fn canonical_name(sync_root: &Path, file_path: &Path) -> Result<String, PathError> {
    let root = lexical_clean(sync_root);
    let file = lexical_clean(file_path);
    let root_name = root
        .file_name()
        .ok_or_else(|| PathError::NoRootName(sync_root.to_path_buf()))?
        .to_string_lossy()
        .into_owned();
    let relative = relative_to(&root, &file).ok_or_else(|| PathError::OutsideRoot {
        root: sync_root.to_path_buf(),
        path: file_path.to_path_buf(),
    })?;

    let mut name = root_name;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                name.push('/');
                name.push_str(&part.to_string_lossy());
            }
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(name)
}

fn relative_to(root: &Path, file: &Path) -> Option<PathBuf> {
    if let Ok(relative) = file.strip_prefix(root) {
        return Some(relative.to_path_buf());
    }
    // Roots are matched case-insensitively on these platforms.
    if cfg!(any(target_os = "windows", target_os = "macos")) {
        let root_parts: Vec<_> = root.components().collect();
        let file_parts: Vec<_> = file.components().collect();
        if file_parts.len() < root_parts.len() {
            return None;
        }
        let same = root_parts.iter().zip(&file_parts).all(|(a, b)| {
            a.as_os_str().to_string_lossy().to_lowercase()
                == b.as_os_str().to_string_lossy().to_lowercase()
        });
        if same {
            return Some(file_parts[root_parts.len()..].iter().collect());
        }
    }
    None
}
