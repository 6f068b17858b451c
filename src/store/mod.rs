//! Filesystem-backed persistence for active job documents.
//!
//! Each service keeps one file per unfinished job under its own directory,
//! `job-<id>.json`, written atomically (temp file then rename). The files
//! are the crash-recovery source of truth: everything present at startup is
//! an unfinished job that must be rehydrated.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::messages::JobDocument;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid job document: {0}")]
    Document(#[from] crate::messages::DocumentError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    /// Open the per-service job directory, creating it if absent.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the job document, stamping the `job_file` backref into it
    /// first so a rehydrated job knows its own file.
    pub fn persist(&self, doc: &mut JobDocument) -> Result<PathBuf> {
        let path = self.job_path(doc.id()?);
        doc.insert("job_file", json!(path.to_string_lossy()));

        let body = serde_json::to_vec_pretty(doc)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), "job persisted");
        Ok(path)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.job_path(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Load every job document in the directory. Corrupt files are logged
    /// and skipped, never deleted.
    pub fn list_all(&self) -> Result<Vec<JobDocument>> {
        let mut docs = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_job_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("job-") && name.ends_with(".json"));
            if !is_job_file {
                continue;
            }

            match fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|raw| JobDocument::from_slice(&raw).map_err(StoreError::from))
            {
                Ok(doc) => docs.push(doc),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable job file");
                }
            }
        }

        Ok(docs)
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("job-{id}.json"))
    }
}
