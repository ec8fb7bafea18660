//! Shared logging setup for datascanner stages.
//!
//! Every stage logs to stderr and to `<home>/logs/<stage>.log`. The file is
//! rotated by size into `<stage>.log.1`, `<stage>.log.2`, ... and the
//! oldest rotation beyond the retention count is deleted.

use anyhow::{Context, Result};
use datascanner_protocol::paths::default_logs_dir;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "datascanner=info,datascanner_pipeline=info,datascanner_engine=info,datascanner_db=info";
const VERBOSE_LOG_FILTER: &str =
    "datascanner=debug,datascanner_pipeline=debug,datascanner_engine=debug,datascanner_db=debug";
const DEFAULT_RETAINED_FILES: usize = 5;
const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for one process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base name of the log file, normally the stage name.
    pub app_name: String,
    /// Debug output on stderr. Wins over `quiet`.
    pub verbose: bool,
    /// Only warnings and errors on stderr.
    pub quiet: bool,
    /// Overrides `<home>/logs`.
    pub log_dir: Option<PathBuf>,
    pub retained_files: usize,
    pub max_file_size: u64,
}

impl LogConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            verbose: false,
            quiet: false,
            log_dir: None,
            retained_files: DEFAULT_RETAINED_FILES,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    fn resolved_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_logs_dir)
    }
}

/// Install the global subscriber: a file layer and a stderr layer, both
/// filtered by `RUST_LOG` when it is set.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let dir = config.resolved_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    let file_writer = SharedRotatingWriter::open(&dir, &config)
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(VERBOSE_LOG_FILTER))
    } else if config.quiet {
        EnvFilter::new("warn")
    } else {
        env_filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

// ============================================================================
// Size-rotated file
// ============================================================================

struct RotatingFile {
    dir: PathBuf,
    stem: String,
    retained: usize,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, name: &str, retained: usize, max_size: u64) -> io::Result<Self> {
        let mut rotating = Self {
            dir: dir.to_path_buf(),
            stem: file_stem(name),
            retained: retained.max(1),
            max_size,
            file: None,
            written: 0,
        };
        rotating.reopen()?;
        if rotating.written > rotating.max_size {
            rotating.rotate()?;
        }
        Ok(rotating)
    }

    fn live_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn rotation_path(&self, generation: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, generation))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.live_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Shift every rotation up one generation, dropping the oldest, and
    /// start a fresh live file.
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let oldest = self.retained - 1;
        if oldest > 0 {
            let expired = self.rotation_path(oldest);
            if expired.exists() {
                fs::remove_file(&expired)?;
            }
            for generation in (1..oldest).rev() {
                let from = self.rotation_path(generation);
                if from.exists() {
                    fs::rename(&from, self.rotation_path(generation + 1))?;
                }
            }
            let live = self.live_path();
            if live.exists() {
                fs::rename(live, self.rotation_path(1))?;
            }
        } else {
            fs::remove_file(self.live_path())?;
        }
        self.reopen()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let written = file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedRotatingWriter(Arc<Mutex<RotatingFile>>);

impl SharedRotatingWriter {
    fn open(dir: &Path, config: &LogConfig) -> io::Result<Self> {
        let file = RotatingFile::open(dir, &config.app_name, config.retained_files, config.max_file_size)?;
        Ok(Self(Arc::new(Mutex::new(file))))
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut RotatingFile) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut file)
    }
}

impl Write for SharedRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRotatingWriter {
    type Writer = SharedRotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if stem.is_empty() {
        "datascanner".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotation_keeps_retention_count() {
        let tmp = TempDir::new().unwrap();
        let mut file = RotatingFile::open(tmp.path(), "matcher", 3, 10).unwrap();
        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            file.write_all(line.as_bytes()).unwrap();
        }
        file.flush().unwrap();

        let read = |name: &str| fs::read_to_string(tmp.path().join(name)).unwrap();
        assert_eq!(read("matcher.log"), "dddddddd\n");
        assert_eq!(read("matcher.log.1"), "cccccccc\n");
        assert_eq!(read("matcher.log.2"), "bbbbbbbb\n");
        assert!(!tmp.path().join("matcher.log.3").exists());
    }

    #[test]
    fn test_oversized_file_is_rotated_on_open() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("tagger.log"), "x".repeat(64)).unwrap();
        let file = RotatingFile::open(tmp.path(), "tagger", 2, 16).unwrap();
        assert_eq!(file.written, 0);
        assert!(tmp.path().join("tagger.log.1").exists());
    }

    #[test]
    fn test_stem_is_sanitised() {
        assert_eq!(file_stem("run all/stages"), "run_all_stages");
        assert_eq!(file_stem(""), "datascanner");
    }
}
