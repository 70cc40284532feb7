//! Page image extraction with Poppler's `pdftoppm`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{job_dir, ImageOptions, JobPool, UploadedDocument};
use crate::config::CommandLine;
use crate::error::JobError;
use crate::process::run_with_timeout;

/// One rendered page.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// `<stem>.page_<n>.<ext>`
    pub file_name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PageRasterizer {
    command: CommandLine,
    timeout: Duration,
    temp_root: Option<PathBuf>,
    pool: JobPool,
}

impl PageRasterizer {
    pub fn new(
        command: CommandLine,
        timeout: Duration,
        temp_root: Option<PathBuf>,
        pool: JobPool,
    ) -> Self {
        Self {
            command,
            timeout,
            temp_root,
            pool,
        }
    }

    /// Render every page of `document`, ordered by page number.
    pub async fn render(
        &self,
        document: &UploadedDocument,
        options: &ImageOptions,
    ) -> Result<Vec<PageImage>, JobError> {
        document.validate_pdf()?;
        options.validate()?;

        let span = info_span!("rasterize_job", job_id = %Uuid::new_v4(), file = %document.file_name);
        self.render_validated(document, options).instrument(span).await
    }

    async fn render_validated(
        &self,
        document: &UploadedDocument,
        options: &ImageOptions,
    ) -> Result<Vec<PageImage>, JobError> {
        let _permit = self.pool.acquire().await?;

        let dir = job_dir("rasterize-job-", self.temp_root.as_deref())?;
        let input_path = dir.path().join("input.pdf");
        let pages_dir = dir.path().join("pages");
        tokio::fs::create_dir(&pages_dir).await?;
        tokio::fs::write(&input_path, &document.data).await?;

        let mut args = options.to_cli_args();
        args.push(input_path.into_os_string());
        args.push(pages_dir.join("page").into_os_string());

        let output = run_with_timeout(&self.command, args, Some(dir.path()), self.timeout).await?;
        if !output.success() {
            warn!(exit_code = ?output.exit_code(), stderr = %output.stderr, "Rasterizer failed");
            return Err(JobError::ProcessingFailed {
                program: self.command.program.clone(),
                exit_code: output.exit_code(),
                reason: "could not render pages".to_string(),
                stderr: output.stderr,
            });
        }

        let mut pages = collect_pages(&pages_dir).await?;
        if pages.is_empty() {
            return Err(JobError::ProcessingFailed {
                program: self.command.program.clone(),
                exit_code: output.exit_code(),
                reason: "rasterizer produced no pages".to_string(),
                stderr: output.stderr,
            });
        }
        pages.sort_by_key(|(number, _)| *number);

        let stem = document.stem();
        let extension = options.format.extension();
        let mut images = Vec::with_capacity(pages.len());
        for (page_number, path) in pages {
            images.push(PageImage {
                file_name: format!("{}.page_{}.{}", stem, page_number, extension),
                data: tokio::fs::read(&path).await?,
            });
        }

        info!("Rendered {} pages from {}", images.len(), document.file_name);
        Ok(images)
    }
}

/// Find `page-<n>.<ext>` files; `pdftoppm` zero-pads `<n>` to the page count width.
async fn collect_pages(dir: &Path) -> Result<Vec<(u32, PathBuf)>, JobError> {
    let mut pages = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(number) = page_number(&path) {
            pages.push((number, path));
        }
    }
    Ok(pages)
}

fn page_number(path: &Path) -> Option<u32> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("page-")?
        .parse()
        .ok()
}
