use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty file reference")]
    Empty,
    #[error("'{0}' resolves outside the upload directory")]
    OutsideRoot(String),
    #[error("'{0}' does not exist in the upload directory")]
    NotFound(String),
    #[error("'{0}' is not a regular file")]
    NotAFile(String),
    #[error("cannot resolve upload directory {0}")]
    BadRoot(String),
}

/// Normalize a path by resolving `.` and `..` components without touching the filesystem.
/// Unlike `canonicalize()`, this works even if the path doesn't exist.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match components.last() {
                // can't go above root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                Some(Component::ParentDir) | None => components.push(component),
                Some(_) => {
                    components.pop();
                }
            },
            _ => components.push(component),
        }
    }

    let mut result = PathBuf::new();
    for c in &components {
        result.push(c.as_os_str());
    }
    if result.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        result
    }
}

struct Root {
    logical: PathBuf,
    physical: PathBuf,
}

/// The upload root as an absolute, normalized path, plus its symlink-free
/// form when the directory exists.
fn resolve_root(root: &Path) -> Result<Root, PathError> {
    let absolute =
        std::path::absolute(root).map_err(|_| PathError::BadRoot(root.display().to_string()))?;
    let logical = normalize_path(&absolute);
    let physical = std::fs::canonicalize(&logical).unwrap_or_else(|_| logical.clone());
    Ok(Root { logical, physical })
}

fn strictly_under(path: &Path, base: &Path) -> bool {
    path.starts_with(base) && path != base
}

/// Resolve a file reference to a readable file inside `root`.
///
/// Relative references are joined onto the root. The result must stay under
/// the root both logically (after `..` is folded) and physically (after
/// symlinks are followed). `Path::starts_with` compares whole components, so
/// a sibling like `uploads_evil` never passes for `uploads`.
pub fn confine_to_root(root: &Path, reference: &str) -> Result<PathBuf, PathError> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(PathError::Empty);
    }

    let root = resolve_root(root)?;
    let candidate = Path::new(reference);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.physical.join(candidate)
    };
    let logical = normalize_path(&joined);
    if !strictly_under(&logical, &root.logical) && !strictly_under(&logical, &root.physical) {
        return Err(PathError::OutsideRoot(reference.to_string()));
    }

    let physical = match std::fs::canonicalize(&logical) {
        Ok(p) => p,
        Err(_) => return Err(PathError::NotFound(reference.to_string())),
    };
    if !strictly_under(&physical, &root.physical) {
        return Err(PathError::OutsideRoot(reference.to_string()));
    }
    if !physical.is_file() {
        return Err(PathError::NotAFile(reference.to_string()));
    }

    Ok(physical)
}

/// Where an uploaded file named `file_name` lands. Only the final component
/// of the name is kept.
pub fn upload_target(root: &Path, file_name: &str) -> Result<PathBuf, PathError> {
    let name = Path::new(file_name.trim())
        .components()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_os_string()),
            _ => None,
        })
        .last()
        .ok_or(PathError::Empty)?;
    Ok(resolve_root(root)?.physical.join(name))
}
