//! Output-tree handling for reconstructed files.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use crate::error::RecoveryError;

/// Join an engine-reported relative path under the output root.
///
/// Names come straight from on-disk metadata, which is untrusted: rooted
/// components and `..` must not escape the output directory, so they are
/// dropped.
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for comp in Path::new(relative).components() {
        match comp {
            Component::Normal(part) => out.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                log::warn!("dropping unsafe path component in {:?}", relative);
            }
            Component::CurDir => {}
        }
    }
    out
}

/// Create the output directory itself. Idempotent.
pub fn ensure_root(root: &Path) -> Result<(), RecoveryError> {
    fs::create_dir_all(root).map_err(|e| RecoveryError::output(root, e))
}

/// Create an output file, making intermediate directories as needed.
pub fn create_file(root: &Path, relative: &str) -> Result<File, RecoveryError> {
    let path = resolve(root, relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RecoveryError::output(parent, e))?;
    }
    File::create(&path).map_err(|e| RecoveryError::output(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_joins_nested_components() {
        let out = resolve(Path::new("/out"), "Documents/Work/report.pdf");
        assert_eq!(out, Path::new("/out/Documents/Work/report.pdf"));
    }

    #[test]
    fn resolve_drops_escaping_components() {
        let out = resolve(Path::new("/out"), "../../etc/passwd");
        assert_eq!(out, Path::new("/out/etc/passwd"));

        let out = resolve(Path::new("/out"), "/abs/name.txt");
        assert_eq!(out, Path::new("/out/abs/name.txt"));
    }

    #[test]
    fn create_file_makes_parent_dirs() {
        let root = tempfile::tempdir().unwrap();
        create_file(root.path(), "a/b/c.bin").unwrap();
        assert!(root.path().join("a/b/c.bin").exists());
    }
}
