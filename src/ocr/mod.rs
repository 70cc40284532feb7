//! OCR jobs backed by external command-line tools.
//!
//! [`ocrmypdf::OcrRunner`] adds a text layer to an uploaded PDF, and
//! [`rasterize::PageRasterizer`] renders PDF pages to images. Both write the
//! upload into a per-job scratch directory, run one subprocess under the
//! shared [`JobPool`], and drop the directory on every exit path.

pub mod ocrmypdf;
pub mod options;
pub mod rasterize;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::JobError;

pub use options::{ImageOptions, OcrOptions};

/// A file received from the browser. Owned by a single request.
#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub file_name: String,
    pub data: Vec<u8>,
}

impl UploadedDocument {
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            data,
        }
    }

    /// Reject empty and non-PDF uploads before any subprocess is started.
    pub fn validate_pdf(&self) -> Result<(), JobError> {
        if self.data.is_empty() {
            return Err(JobError::EmptyUpload);
        }
        let is_pdf = infer::get(&self.data)
            .map(|kind| kind.mime_type() == "application/pdf")
            .unwrap_or(false);
        if !is_pdf {
            return Err(JobError::NotPdf {
                file_name: self.file_name.clone(),
            });
        }
        Ok(())
    }

    /// File name without directories or the `.pdf` extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("document")
    }
}

/// Bounds the number of external processes running at once.
///
/// Jobs past the limit wait for a permit rather than being rejected.
#[derive(Debug, Clone)]
pub struct JobPool {
    permits: Arc<Semaphore>,
}

impl JobPool {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        }
    }

    /// Wait for a free slot. Fails once the pool has been closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, JobError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JobError::ShuttingDown)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop handing out slots. Running jobs keep theirs; queued ones fail.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Create a fresh scratch directory for one job.
pub(crate) fn job_dir(prefix: &str, root: Option<&Path>) -> Result<tempfile::TempDir, JobError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let dir = match root {
        Some(root) => builder.tempdir_in(root)?,
        None => builder.tempdir()?,
    };
    Ok(dir)
}
