use std::path::{Path, PathBuf};

use tracing::error;
use walkdir::WalkDir;

/// Collects every regular file below `root`, in directory-walk order.
///
/// Traversal errors (permissions, dangling links) are logged and the
/// affected entries skipped; they never abort the collection.
pub fn collect_files<P: AsRef<Path>>(root: P) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root.as_ref()) {
        match entry {
            Ok(entry) => {
                if entry.path().is_file() {
                    files.push(entry.into_path());
                }
            }
            Err(e) => {
                error!("Failed to traverse directory: {}", e);
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_only_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.dcm"), b"x").unwrap();
        std::fs::write(dir.path().join("sub").join("b.dcm"), b"y").unwrap();

        let mut files = collect_files(dir.path());
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.is_file()));
    }

    #[test]
    fn traversal_of_a_plain_file_yields_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("single.dcm");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(collect_files(&file), vec![file]);
    }
}
