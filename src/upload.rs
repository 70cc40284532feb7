//! Reading multipart form submissions.

use std::collections::HashMap;

use axum::extract::multipart::MultipartError;
use axum::extract::Multipart;
use axum::http::StatusCode;
use tracing::debug;

use crate::error::JobError;
use crate::ocr::UploadedDocument;

/// Everything submitted with one form: the `file` parts and all other fields.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub files: Vec<UploadedDocument>,
    pub fields: HashMap<String, String>,
}

impl UploadForm {
    pub async fn read(mut multipart: Multipart) -> Result<Self, JobError> {
        let mut form = Self::default();

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" || name == "files" {
                let file_name = field.file_name().unwrap_or("document.pdf").to_string();
                let data = field.bytes().await.map_err(multipart_error)?.to_vec();
                // Browsers send an empty part when no file was chosen.
                if file_name.is_empty() && data.is_empty() {
                    continue;
                }
                debug!("Received file: {} ({} bytes)", file_name, data.len());
                form.files.push(UploadedDocument::new(file_name, data));
            } else {
                let value = field.text().await.map_err(multipart_error)?;
                form.fields.insert(name, value);
            }
        }

        Ok(form)
    }

    /// The single uploaded file; more than one is an error.
    pub fn single_file(mut self) -> Result<(UploadedDocument, HashMap<String, String>), JobError> {
        match self.files.len() {
            0 => Err(JobError::EmptyUpload),
            1 => Ok((self.files.remove(0), self.fields)),
            n => Err(JobError::Upload(format!(
                "expected one file, got {}; use the batch endpoint for several",
                n
            ))),
        }
    }
}

fn multipart_error(e: MultipartError) -> JobError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        JobError::UploadTooLarge
    } else {
        JobError::Upload(e.body_text())
    }
}
