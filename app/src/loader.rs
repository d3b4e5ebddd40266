use std::io::Read;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use dcmkit_common::CancelFlag;
use dcmkit_common::dicom::is_dicom_file;
use dcmkit_common::fs::collect_files;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Path does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("No DICOM files found under {}", .0.display())]
    NoDicomFiles(PathBuf),
    #[error("Failed to read zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A loaded input: the DICOM file list plus, for zip input, the
/// temporary directory keeping the extracted files alive. Dropping the
/// session deletes that directory.
#[derive(Debug)]
pub struct LoadedSession {
    pub files: Vec<PathBuf>,
    pub temp_dir: Option<TempDir>,
    pub cancelled: bool,
}

/// Loads a file, directory or zip archive, returning the DICOM files it
/// contains. Directories with a DICOMDIR are loaded through it when it
/// accounts for at least as many files as a raw scan would find.
pub fn load_path<F>(path: &Path, cancel: &CancelFlag, progress: F) -> Result<LoadedSession, LoadError>
where
    F: FnMut(usize, usize, &str),
{
    if !path.exists() {
        return Err(LoadError::NotFound(path.to_path_buf()));
    }
    if path.is_file() {
        if path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("zip"))
            .unwrap_or(false)
        {
            return load_zip(path, cancel, progress);
        }
        if !is_dicom_file(path) {
            return Err(LoadError::NoDicomFiles(path.to_path_buf()));
        }
        return Ok(LoadedSession {
            files: vec![path.to_path_buf()],
            temp_dir: None,
            cancelled: false,
        });
    }
    let files = load_directory(path, cancel, progress)?;
    Ok(LoadedSession {
        files,
        temp_dir: None,
        cancelled: cancel.is_cancelled(),
    })
}

fn load_zip<F>(
    zip_path: &Path,
    cancel: &CancelFlag,
    mut progress: F,
) -> Result<LoadedSession, LoadError>
where
    F: FnMut(usize, usize, &str),
{
    info!("Extracting zip archive {}", zip_path.display());
    let temp_dir = TempDir::new()?;
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let total = archive.len();
    for index in 0..total {
        if cancel.is_cancelled() {
            return Ok(LoadedSession {
                files: Vec::new(),
                temp_dir: Some(temp_dir),
                cancelled: true,
            });
        }
        let mut entry = archive.by_index(index)?;
        progress(index + 1, total, entry.name());
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!("Skipping zip entry with unsafe path: {}", entry.name());
            continue;
        };
        let target = temp_dir.path().join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        std::fs::write(&target, content)?;
    }

    let files = load_directory(temp_dir.path(), cancel, progress)?;
    Ok(LoadedSession {
        files,
        temp_dir: Some(temp_dir),
        cancelled: cancel.is_cancelled(),
    })
}

fn load_directory<F>(
    dir: &Path,
    cancel: &CancelFlag,
    mut progress: F,
) -> Result<Vec<PathBuf>, LoadError>
where
    F: FnMut(usize, usize, &str),
{
    let candidates = collect_files(dir);
    let total = candidates.len();

    let mut scanned = Vec::new();
    let mut dicomdir_path = None;
    for (index, candidate) in candidates.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(scanned);
        }
        let name = candidate
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        progress(index + 1, total, &name);
        if name.eq_ignore_ascii_case("DICOMDIR") {
            dicomdir_path.get_or_insert(candidate);
            continue;
        }
        if is_dicom_file(&candidate) {
            scanned.push(candidate);
        }
    }

    if let Some(dicomdir) = dicomdir_path {
        match dcmkit_dicomdir::read_referenced_files(&dicomdir) {
            Ok(referenced) if !referenced.is_empty() && referenced.len() >= scanned.len() => {
                info!(
                    "Loaded {} file(s) through DICOMDIR {}",
                    referenced.len(),
                    dicomdir.display()
                );
                return Ok(referenced);
            }
            Ok(referenced) => {
                debug!(
                    "DICOMDIR accounts for {} file(s), scan found {}; using the scan",
                    referenced.len(),
                    scanned.len()
                );
            }
            Err(e) => {
                warn!(
                    "Could not load through DICOMDIR {}: {}",
                    dicomdir.display(),
                    e
                );
            }
        }
    }

    if scanned.is_empty() {
        return Err(LoadError::NoDicomFiles(dir.to_path_buf()));
    }
    info!("Found {} DICOM file(s) under {}", scanned.len(), dir.display());
    Ok(scanned)
}
