//! Logging Setup
//!
//! Application events go to stdout unless a log file is configured. The
//! HTTP access log (one `tower_http::trace` event per response, carrying
//! method, uri, tid, status and latency) rides along with them by default;
//! given its own file, it is written there and left out of the
//! application sink.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Target prefix of the request/response events emitted by `TraceLayer`
pub const ACCESS_LOG_TARGET: &str = "tower_http::trace";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Where and how to log
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// trace, debug, info, warn or error; unknown values mean info
    pub level: String,
    pub json: bool,
    /// Application log file, stdout when unset
    pub file: Option<PathBuf>,
    /// Separate access log file
    pub access_file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
            access_file: None,
        }
    }
}

/// Install the global subscriber
pub fn init(settings: &LogSettings) -> Result<()> {
    tracing_subscriber::registry()
        .with(layers(settings)?)
        .try_init()
        .map_err(|e| Error::Configuration(format!("cannot install logger: {}", e)))
}

pub fn parse_level(raw: &str) -> Level {
    match raw.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn layers(settings: &LogSettings) -> Result<Vec<BoxedLayer>> {
    let app_writer = match &settings.file {
        Some(path) => BoxMakeWriter::new(Mutex::new(open_sink(path)?)),
        None => BoxMakeWriter::new(std::io::stdout),
    };
    let app = format_layer(app_writer, settings.json, settings.file.is_none());

    let mut layers = vec![app.with_filter(app_filter(settings)).boxed()];
    if let Some(path) = &settings.access_file {
        let writer = BoxMakeWriter::new(Mutex::new(open_sink(path)?));
        let access = format_layer(writer, settings.json, false);
        layers.push(
            access
                .with_filter(Targets::new().with_target(ACCESS_LOG_TARGET, Level::INFO))
                .boxed(),
        );
    }
    Ok(layers)
}

fn format_layer(writer: BoxMakeWriter, json: bool, ansi: bool) -> BoxedLayer {
    if json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed()
    }
}

fn app_filter(settings: &LogSettings) -> EnvFilter {
    let access = if settings.access_file.is_some() {
        "tower_http=off"
    } else {
        "tower_http=info"
    };

    let mut filter = EnvFilter::from_default_env().add_directive(parse_level(&settings.level).into());
    for directive in ["hyper=warn", "tower=warn", "axum=info", access] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Open `path` for appending, creating missing parent directories
fn open_sink(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Configuration(format!("cannot open log file {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_open_sink_appends() {
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/nested/app.log");
        writeln!(open_sink(&path).unwrap(), "first").unwrap();
        writeln!(open_sink(&path).unwrap(), "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_access_events_get_their_own_file() {
        let dir = TempDir::new().unwrap();
        let settings = LogSettings {
            file: Some(dir.path().join("app.log")),
            access_file: Some(dir.path().join("access.log")),
            ..LogSettings::default()
        };
        let subscriber = tracing_subscriber::registry().with(layers(&settings).unwrap());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "tower_http::trace::on_response", "finished processing request");
            tracing::info!(target: "sync_gateway::storage", "folder created");
            tracing::debug!(target: "sync_gateway::storage", "below the configured level");
        });

        let app = std::fs::read_to_string(dir.path().join("app.log")).unwrap();
        let access = std::fs::read_to_string(dir.path().join("access.log")).unwrap();
        assert!(app.contains("folder created"));
        assert!(!app.contains("finished processing request"));
        assert!(!app.contains("below the configured level"));
        assert!(access.contains("finished processing request"));
        assert!(!access.contains("folder created"));
    }
}
