//! The OCR job runner, wrapping the `ocrmypdf` CLI.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{job_dir, JobPool, OcrOptions, UploadedDocument};
use crate::config::CommandLine;
use crate::error::JobError;
use crate::process::{run_with_timeout, CommandOutput};

/// A successfully processed document.
#[derive(Debug, Clone)]
pub struct OcrOutput {
    /// Name to offer the browser; the same as the upload.
    pub file_name: String,
    pub data: Vec<u8>,
    /// Engine warnings; may be non-empty even on success.
    pub stderr: String,
}

/// Runs `ocrmypdf` on one uploaded document at a time per call.
#[derive(Debug, Clone)]
pub struct OcrRunner {
    engine: CommandLine,
    timeout: Duration,
    temp_root: Option<PathBuf>,
    pool: JobPool,
}

impl OcrRunner {
    pub fn new(
        engine: CommandLine,
        timeout: Duration,
        temp_root: Option<PathBuf>,
        pool: JobPool,
    ) -> Self {
        Self {
            engine,
            timeout,
            temp_root,
            pool,
        }
    }

    /// OCR `document` and return the rewritten PDF.
    pub async fn run(
        &self,
        document: &UploadedDocument,
        options: &OcrOptions,
    ) -> Result<OcrOutput, JobError> {
        document.validate_pdf()?;
        options.validate()?;

        let job_id = Uuid::new_v4();
        let span = info_span!("ocr_job", %job_id, file = %document.file_name);
        self.run_validated(document, options).instrument(span).await
    }

    async fn run_validated(
        &self,
        document: &UploadedDocument,
        options: &OcrOptions,
    ) -> Result<OcrOutput, JobError> {
        debug!("Waiting for a job slot ({} free)", self.pool.available());
        let _permit = self.pool.acquire().await?;
        info!(
            "Starting OCR of {} ({} bytes)",
            document.file_name,
            document.data.len()
        );

        let dir = job_dir("ocr-job-", self.temp_root.as_deref())?;
        let input_path = dir.path().join("input.pdf");
        let output_path = dir.path().join("output.pdf");
        tokio::fs::write(&input_path, &document.data).await?;

        let mut args = options.to_cli_args();
        args.push(input_path.into_os_string());
        args.push(output_path.clone().into_os_string());

        let output = run_with_timeout(&self.engine, args, Some(dir.path()), self.timeout).await?;
        if !output.success() {
            warn!(
                exit_code = ?output.exit_code(),
                stderr = %output.stderr,
                "OCR engine reported failure"
            );
            return Err(processing_failed(&self.engine.program, output));
        }

        let data = match tokio::fs::read(&output_path).await {
            Ok(data) if !data.is_empty() => data,
            Ok(_) | Err(_) => {
                return Err(JobError::ProcessingFailed {
                    program: self.engine.program.clone(),
                    exit_code: output.exit_code(),
                    reason: "engine reported success but wrote no output".to_string(),
                    stderr: output.stderr,
                });
            }
        };

        info!(
            "OCR of {} complete ({} bytes out)",
            document.file_name,
            data.len()
        );
        Ok(OcrOutput {
            file_name: document.file_name.clone(),
            data,
            stderr: output.stderr,
        })
    }

    /// Ask the engine for its version, e.g. `16.5.0`.
    pub async fn engine_version(&self) -> Result<String, JobError> {
        let output = run_with_timeout(
            &self.engine,
            vec!["--version".into()],
            None,
            Duration::from_secs(30),
        )
        .await?;
        if !output.success() {
            return Err(processing_failed(&self.engine.program, output));
        }
        Ok(output.stdout.trim().to_string())
    }

    pub fn engine(&self) -> &CommandLine {
        &self.engine
    }
}

fn processing_failed(program: &str, output: CommandOutput) -> JobError {
    let exit_code = output.exit_code();
    let reason = match exit_code {
        Some(code) => describe_exit_code(code).to_string(),
        None => "terminated by a signal".to_string(),
    };
    JobError::ProcessingFailed {
        program: program.to_string(),
        exit_code,
        reason,
        stderr: output.stderr,
    }
}

/// Documented meaning of an `ocrmypdf` exit code.
pub fn describe_exit_code(code: i32) -> &'static str {
    match code {
        0 => "success",
        1 => "invalid arguments",
        2 => "input file is not a valid PDF",
        3 => "a required dependency is missing",
        4 => "output file is not a valid PDF",
        5 => "file access error",
        6 => "page already has text",
        7 => "a child process failed",
        8 => "input PDF is encrypted",
        9 => "invalid engine configuration",
        10 => "PDF/A conversion failed",
        130 => "interrupted",
        _ => "unexpected error",
    }
}
