use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Persists a snapshot of the frame that triggered an accepted alert
pub trait EvidenceStore {
    fn capture(&self, image: &[u8], at: DateTime<Local>) -> Result<PathBuf, EvidenceError>;
}

/// Writes evidence as `intruder_<YYYYMMDD_HHMMSS>.jpg` into a single directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    directory: PathBuf,
}

impl DirectoryStore {
    /// Creates the directory (and parents) if needed
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, EvidenceError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .map_err(|e| EvidenceError::Io(directory.clone(), e))?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, at: DateTime<Local>) -> PathBuf {
        self.directory.join(evidence_file_name(at))
    }
}

impl EvidenceStore for DirectoryStore {
    fn capture(&self, image: &[u8], at: DateTime<Local>) -> Result<PathBuf, EvidenceError> {
        let path = self.path_for(at);
        std::fs::write(&path, image).map_err(|e| EvidenceError::Io(path.clone(), e))?;
        Ok(path)
    }
}

pub fn evidence_file_name(at: DateTime<Local>) -> String {
    format!("intruder_{}.jpg", at.format("%Y%m%d_%H%M%S"))
}

quick_error! {
    #[derive(Debug)]
    pub enum EvidenceError {
        Io(path: PathBuf, error: std::io::Error) {
            display("Unable to write evidence to {}: {}", path.display(), error)
            source(error)
        }
    }
}
