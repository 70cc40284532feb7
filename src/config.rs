//! Server configuration.
//!
//! Values come from the environment (a `.env` file is loaded first by `main`).
//! Every variable is optional; unset variables fall back to the defaults below.

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8502;
const DEFAULT_ENGINE_COMMAND: &str = "ocrmypdf";
const DEFAULT_RASTERIZER_COMMAND: &str = "pdftoppm";
const DEFAULT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MAX_UPLOAD_MB: usize = 200;

/// An external program plus any leading arguments.
///
/// Parsed from a whitespace-separated string so wrappers such as
/// `docker run --rm -i ocrmypdf` can stand in for the bare binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

impl FromStr for CommandLine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| anyhow::anyhow!("command line is empty"))?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runtime configuration for the portal.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// The OCR engine invocation, `ocrmypdf` by default.
    pub engine: CommandLine,
    /// Page rasterizer used by image extraction, `pdftoppm` by default.
    pub rasterizer: CommandLine,
    /// Wall-clock limit for a single subprocess.
    pub job_timeout: Duration,
    /// Maximum number of external processes running at once.
    pub max_concurrent_jobs: usize,
    pub max_upload_bytes: usize,
    /// Parent directory for per-job scratch directories.
    pub temp_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            engine: CommandLine::new(DEFAULT_ENGINE_COMMAND),
            rasterizer: CommandLine::new(DEFAULT_RASTERIZER_COMMAND),
            job_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_concurrent_jobs: num_cpus::get().max(1),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            temp_root: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("OCR_PORTAL_HOST") {
            config.host = parse_var("OCR_PORTAL_HOST", &host)?;
        }
        if let Some(port) = lookup("OCR_PORTAL_PORT") {
            config.port = parse_var("OCR_PORTAL_PORT", &port)?;
        }
        if let Some(engine) = lookup("OCR_ENGINE_COMMAND") {
            config.engine = parse_var("OCR_ENGINE_COMMAND", &engine)?;
        }
        if let Some(rasterizer) = lookup("OCR_RASTERIZER_COMMAND") {
            config.rasterizer = parse_var("OCR_RASTERIZER_COMMAND", &rasterizer)?;
        }
        if let Some(secs) = lookup("OCR_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_var("OCR_JOB_TIMEOUT_SECS", &secs)?;
            if secs == 0 {
                anyhow::bail!("OCR_JOB_TIMEOUT_SECS must be greater than zero");
            }
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(jobs) = lookup("OCR_MAX_CONCURRENT_JOBS") {
            let jobs: usize = parse_var("OCR_MAX_CONCURRENT_JOBS", &jobs)?;
            if jobs == 0 {
                anyhow::bail!("OCR_MAX_CONCURRENT_JOBS must be greater than zero");
            }
            config.max_concurrent_jobs = jobs;
        }
        if let Some(mb) = lookup("OCR_MAX_UPLOAD_MB") {
            let mb: usize = parse_var("OCR_MAX_UPLOAD_MB", &mb)?;
            config.max_upload_bytes = mb
                .checked_mul(1024 * 1024)
                .with_context(|| format!("OCR_MAX_UPLOAD_MB is too large: {}", mb))?;
        }
        if let Some(dir) = lookup("OCR_TEMP_DIR") {
            let dir = PathBuf::from(dir);
            if !dir.is_dir() {
                anyhow::bail!("OCR_TEMP_DIR is not a directory: {:?}", dir);
            }
            config.temp_root = Some(dir);
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid value for {}: {:?}", name, value))
}
