//! OCR Portal - upload a PDF, get it back with an OCR text layer.

mod archive;
mod config;
mod error;
mod ocr;
mod process;
mod upload;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use config::Config;
use error::{ErrorBody, JobError};
use ocr::ocrmypdf::OcrRunner;
use ocr::rasterize::PageRasterizer;
use ocr::{ImageOptions, JobPool, OcrOptions};
use serde::Serialize;
use std::net::IpAddr;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upload::UploadForm;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Web front-end for OCRmyPDF.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Opts {
    /// Address to bind (overrides OCR_PORTAL_HOST).
    #[arg(long)]
    host: Option<IpAddr>,
    /// Port to listen on (overrides OCR_PORTAL_PORT).
    #[arg(long)]
    port: Option<u16>,
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    runner: OcrRunner,
    rasterizer: PageRasterizer,
    pool: JobPool,
}

impl AppState {
    fn from_config(config: &Config) -> Self {
        // Both tools draw from one pool so the process cap is global.
        let pool = JobPool::new(config.max_concurrent_jobs);
        Self {
            runner: OcrRunner::new(
                config.engine.clone(),
                config.job_timeout,
                config.temp_root.clone(),
                pool.clone(),
            ),
            rasterizer: PageRasterizer::new(
                config.rasterizer.clone(),
                config.job_timeout,
                config.temp_root.clone(),
                pool.clone(),
            ),
            pool,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ocr_portal=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let opts = Opts::parse();
    let mut config = Config::from_env()?;
    if let Some(host) = opts.host {
        config.host = host;
    }
    if let Some(port) = opts.port {
        config.port = port;
    }

    info!(
        "OCR engine: `{}`, rasterizer: `{}`, timeout: {}s, max concurrent jobs: {}",
        config.engine,
        config.rasterizer,
        config.job_timeout.as_secs(),
        config.max_concurrent_jobs
    );

    let state = AppState::from_config(&config);
    match state.runner.engine_version().await {
        Ok(version) => info!("Found {} {}", config.engine.program, version),
        Err(e) => warn!("OCR engine check failed, OCR requests will fail: {}", e),
    }

    let pool = state.pool.clone();
    let app = router(state, config.max_upload_bytes);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Running jobs finish; queued ones are turned away.
            pool.close();
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/engine", get(engine_info))
        .route("/api/ocr", post(ocr_document))
        .route("/api/ocr/batch", post(ocr_batch))
        .route("/api/images", post(extract_images))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Handlers
// ============================================================================

/// The upload page.
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct EngineInfo {
    engine: String,
    version: String,
}

/// Report the installed engine version.
async fn engine_info(State(state): State<AppState>) -> Result<Json<EngineInfo>, JobError> {
    let version = state.runner.engine_version().await?;
    Ok(Json(EngineInfo {
        engine: state.runner.engine().to_string(),
        version,
    }))
}

/// OCR one uploaded PDF and return it.
async fn ocr_document(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, JobError> {
    let (document, fields) = UploadForm::read(multipart).await?.single_file()?;
    let options = OcrOptions::from_fields(&fields)?;

    let output = state.runner.run(&document, &options).await.map_err(|e| {
        log_job_error(&document.file_name, &e);
        e
    })?;
    if !output.stderr.is_empty() {
        debug!("Engine diagnostics for {}:\n{}", output.file_name, output.stderr);
    }

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, attachment(&output.file_name)),
        ],
        output.data,
    )
        .into_response())
}

#[derive(Serialize)]
struct BatchFailure {
    file_name: String,
    #[serde(flatten)]
    error: ErrorBody,
}

#[derive(Serialize)]
struct BatchFailed {
    error: &'static str,
    failures: Vec<BatchFailure>,
}

/// OCR several PDFs one after another and return the successes as a ZIP.
async fn ocr_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, JobError> {
    let form = UploadForm::read(multipart).await?;
    let options = OcrOptions::from_fields(&form.fields)?;
    if form.files.is_empty() {
        return Err(JobError::EmptyUpload);
    }

    let mut entries = Vec::new();
    let mut failures = Vec::new();
    for document in &form.files {
        match state.runner.run(document, &options).await {
            Ok(output) => entries.push((output.file_name, output.data)),
            Err(e) => {
                log_job_error(&document.file_name, &e);
                failures.push(BatchFailure {
                    file_name: document.file_name.clone(),
                    error: e.body(),
                });
            }
        }
    }

    if entries.is_empty() {
        return Ok(all_failed("OCR failed for every uploaded file", failures));
    }
    info!(
        "Batch complete: {} succeeded, {} failed",
        entries.len(),
        failures.len()
    );
    if !failures.is_empty() {
        entries.push(("errors.txt".to_string(), failure_report(&failures).into_bytes()));
    }

    zip_response("OCRmyPDF", entries)
}

/// Render the pages of each uploaded PDF to images and return them as a ZIP.
async fn extract_images(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, JobError> {
    let form = UploadForm::read(multipart).await?;
    let options = ImageOptions::from_fields(&form.fields)?;
    if form.files.is_empty() {
        return Err(JobError::EmptyUpload);
    }

    let mut entries = Vec::new();
    let mut failures = Vec::new();
    for document in &form.files {
        match state.rasterizer.render(document, &options).await {
            Ok(images) => {
                entries.extend(images.into_iter().map(|image| (image.file_name, image.data)));
            }
            Err(e) => {
                // Skip it; the other files still make it into the archive.
                log_job_error(&document.file_name, &e);
                failures.push(BatchFailure {
                    file_name: document.file_name.clone(),
                    error: e.body(),
                });
            }
        }
    }

    if entries.is_empty() {
        return Ok(all_failed("Could not extract images from any uploaded file", failures));
    }
    zip_response("OCRmyPDF", entries)
}

// ============================================================================
// Helper functions
// ============================================================================

fn log_job_error(file_name: &str, e: &JobError) {
    if e.is_validation() {
        info!("Rejected {}: {}", file_name, e);
    } else {
        error!("Job for {} failed: {}", file_name, e);
    }
}

fn all_failed(error: &'static str, failures: Vec<BatchFailure>) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(BatchFailed { error, failures }),
    )
        .into_response()
}

fn failure_report(failures: &[BatchFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}\n", f.file_name, f.error.error))
        .collect()
}

fn zip_response(prefix: &str, entries: Vec<(String, Vec<u8>)>) -> Result<Response, JobError> {
    let file_name = archive::archive_file_name(prefix, chrono::Local::now());
    let mut archive = archive::ArchiveBuilder::new();
    for (name, data) in &entries {
        archive.add(name, data).map_err(archive_error)?;
    }
    let bytes = archive.finish().map_err(archive_error)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, attachment(&file_name)),
        ],
        bytes,
    )
        .into_response())
}

fn archive_error(e: zip::result::ZipError) -> JobError {
    JobError::Io(std::io::Error::other(e))
}

/// `Content-Disposition` value; anything outside printable ASCII becomes `_`.
fn attachment(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{}\"", safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandLine;
    use crate::ocr::testing::{fake_engine, pdf_with, MINIMAL_PDF};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::io::{Cursor, Read};
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "ocr-portal-test-boundary";

    enum Part<'a> {
        File(&'a str, &'a [u8]),
        Field(&'a str, &'a str),
    }

    fn multipart_body(parts: &[Part]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::File(name, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/pdf\r\n\r\n",
                            name
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                }
                Part::Field(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}", name, value)
                            .as_bytes(),
                    );
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn post(uri: &str, parts: &[Part]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    fn state_with(engine: CommandLine, rasterizer: CommandLine) -> AppState {
        let config = Config {
            engine,
            rasterizer,
            job_timeout: Duration::from_secs(10),
            max_concurrent_jobs: 2,
            ..Config::default()
        };
        AppState::from_config(&config)
    }

    fn app_with(engine: CommandLine, rasterizer: CommandLine) -> Router {
        router(state_with(engine, rasterizer), Config::default().max_upload_bytes)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_index() {
        let app = app_with(CommandLine::new("ocrmypdf"), CommandLine::new("pdftoppm"));

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"ok");

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(html.contains("OCRmyPDF"));
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected() {
        let app = app_with(
            CommandLine::new("definitely-not-ocrmypdf"),
            CommandLine::new("pdftoppm"),
        );

        let response = app
            .oneshot(post("/api/ocr", &[Part::File("empty.pdf", b"")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "empty_upload");
    }

    #[tokio::test]
    async fn test_non_pdf_is_rejected() {
        let app = app_with(
            CommandLine::new("definitely-not-ocrmypdf"),
            CommandLine::new("pdftoppm"),
        );

        let response = app
            .oneshot(post("/api/ocr", &[Part::File("notes.txt", b"hello")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_invalid_option_is_rejected() {
        let app = app_with(
            CommandLine::new("definitely-not-ocrmypdf"),
            CommandLine::new("pdftoppm"),
        );

        let response = app
            .oneshot(post(
                "/api/ocr",
                &[Part::File("scan.pdf", MINIMAL_PDF), Part::Field("optimize", "9")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "invalid_options");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let state = state_with(
            CommandLine::new("definitely-not-ocrmypdf"),
            CommandLine::new("pdftoppm"),
        );
        let app = router(state, 64);
        let large = pdf_with(&"x".repeat(4096));

        let response = app
            .oneshot(post("/api/ocr", &[Part::File("large.pdf", &large)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["kind"], "upload_too_large");
    }

    #[tokio::test]
    async fn test_truncated_multipart_is_rejected() {
        let app = app_with(
            CommandLine::new("definitely-not-ocrmypdf"),
            CommandLine::new("pdftoppm"),
        );
        let mut body = multipart_body(&[Part::File("scan.pdf", MINIMAL_PDF)]);
        // Cut into the file data so the closing boundary never arrives.
        body.truncate(body.len() - 40);
        let request = Request::builder()
            .method("POST")
            .uri("/api/ocr")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "upload");
    }

    #[tokio::test]
    async fn test_jobs_after_shutdown_are_turned_away() {
        let state = state_with(
            CommandLine::new("definitely-not-ocrmypdf"),
            CommandLine::new("pdftoppm"),
        );
        state.pool.close();
        let app = router(state, Config::default().max_upload_bytes);

        let response = app
            .oneshot(post("/api/ocr", &[Part::File("scan.pdf", MINIMAL_PDF)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["kind"], "shutting_down");
    }

    #[tokio::test]
    async fn test_missing_engine_is_service_unavailable() {
        let app = app_with(
            CommandLine::new("definitely-not-ocrmypdf"),
            CommandLine::new("pdftoppm"),
        );

        let response = app
            .oneshot(post("/api/ocr", &[Part::File("scan.pdf", MINIMAL_PDF)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["kind"], "engine_unavailable");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ocr_returns_pdf_download() {
        let scripts = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            scripts.path(),
            "cp \"$input\" \"$output\"; printf ' text layer' >> \"$output\"",
        );
        let app = app_with(engine, CommandLine::new("pdftoppm"));

        let response = app
            .oneshot(post(
                "/api/ocr",
                &[Part::File("scan.pdf", MINIMAL_PDF), Part::Field("deskew", "on")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"scan.pdf\""
        );
        let body = body_bytes(response).await;
        assert!(body.starts_with(MINIMAL_PDF));
        assert!(body.ends_with(b" text layer"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_existing_text_layer_reports_diagnostics() {
        let scripts = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            scripts.path(),
            "echo 'PriorOcrFoundError: page already has text!' >&2; exit 6",
        );
        let app = app_with(engine, CommandLine::new("pdftoppm"));

        let response = app
            .oneshot(post("/api/ocr", &[Part::File("ocred.pdf", MINIMAL_PDF)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "processing_failed");
        assert_eq!(body["exit_code"], 6);
        assert!(body["stderr"].as_str().unwrap().contains("already has text"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_zips_successes_and_reports_failures() {
        let scripts = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            scripts.path(),
            "if grep -q broken \"$input\"; then echo 'bad input' >&2; exit 2; fi; cp \"$input\" \"$output\"",
        );
        let app = app_with(engine, CommandLine::new("pdftoppm"));
        let good = pdf_with("good");
        let broken = pdf_with("broken");

        let response = app
            .oneshot(post(
                "/api/ocr/batch",
                &[
                    Part::File("one.pdf", &good),
                    Part::File("two.pdf", &broken),
                    Part::File("three.pdf", &good),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");

        let mut archive = zip::ZipArchive::new(Cursor::new(body_bytes(response).await)).unwrap();
        assert_eq!(archive.len(), 3);
        let mut report = String::new();
        archive
            .by_name("errors.txt")
            .unwrap()
            .read_to_string(&mut report)
            .unwrap();
        assert!(report.starts_with("two.pdf: "));
        assert!(archive.by_name("one.pdf").is_ok());
        assert!(archive.by_name("three.pdf").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_entries_drop_client_directories() {
        let scripts = tempfile::tempdir().unwrap();
        let engine = fake_engine(scripts.path(), "cp \"$input\" \"$output\"");
        let app = app_with(engine, CommandLine::new("pdftoppm"));

        let response = app
            .oneshot(post(
                "/api/ocr/batch",
                &[
                    Part::File("../escape.pdf", MINIMAL_PDF),
                    Part::File("nested/dir/report.pdf", MINIMAL_PDF),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let archive = zip::ZipArchive::new(Cursor::new(body_bytes(response).await)).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["escape.pdf", "report.pdf"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_all_failed() {
        let scripts = tempfile::tempdir().unwrap();
        let engine = fake_engine(scripts.path(), "exit 8");
        let app = app_with(engine, CommandLine::new("pdftoppm"));

        let response = app
            .oneshot(post(
                "/api/ocr/batch",
                &[Part::File("a.pdf", MINIMAL_PDF), Part::File("b.pdf", b"")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        let failures = body["failures"].as_array().unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0]["kind"], "processing_failed");
        assert_eq!(failures[0]["exit_code"], 8);
        assert_eq!(failures[1]["kind"], "empty_upload");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_images_zip() {
        let scripts = tempfile::tempdir().unwrap();
        let rasterizer = fake_engine(
            scripts.path(),
            "printf one > \"$output-1.png\"; printf two > \"$output-2.png\"",
        );
        let app = app_with(CommandLine::new("ocrmypdf"), rasterizer);

        let response = app
            .oneshot(post(
                "/api/images",
                &[
                    Part::File("report.pdf", MINIMAL_PDF),
                    Part::Field("format", "png"),
                    Part::Field("dpi", "150"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut archive = zip::ZipArchive::new(Cursor::new(body_bytes(response).await)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["report.page_1.png", "report.page_2.png"]);
        let mut page = String::new();
        archive
            .by_name("report.page_2.png")
            .unwrap()
            .read_to_string(&mut page)
            .unwrap();
        assert_eq!(page, "two");
    }

    #[test]
    fn test_attachment_header() {
        assert_eq!(attachment("scan.pdf"), "attachment; filename=\"scan.pdf\"");
        assert_eq!(
            attachment("résumé \"final\".pdf"),
            "attachment; filename=\"r_sum_ _final_.pdf\""
        );
    }
}
