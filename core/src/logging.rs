//! Per-rank logging context.
//!
//! There is no process-wide logger. A [`LogContext`] is built explicitly at rank start-up
//! and owned by the training driver; entering it makes its subscriber the thread's default
//! for as long as the returned guard lives. Ranks simulated as threads in one process each
//! get their own context, so every rank can write its own file.

use crate::error::{Result, config_err};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::Dispatch;
use tracing::dispatcher::DefaultGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Target of the per-step training record.
pub const TRAIN_TARGET: &str = "meshtune::train";

/// Seconds since the Unix epoch, shared by every rank's log file name.
pub fn run_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

pub struct LogContext {
    rank: usize,
    level: String,
    log_file: Option<PathBuf>,
    dispatch: Dispatch,
}

impl LogContext {
    /// Stderr only. `RUST_LOG` overrides `level`.
    pub fn new(rank: usize, level: &str) -> Result<Self> {
        Self::build(rank, level, None)
    }

    /// Stderr plus `<work_dir>/<timestamp>.rank<rank>.log`.
    pub fn with_file(rank: usize, level: &str, work_dir: &Path, timestamp: &str) -> Result<Self> {
        std::fs::create_dir_all(work_dir)?;
        Self::build(rank, level, Some((work_dir, format!("{timestamp}.rank{rank}.log"))))
    }

    fn build(rank: usize, level: &str, file: Option<(&Path, String)>) -> Result<Self> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| config_err(format!("invalid log level `{level}`: {e}")))?;

        let log_file = file.as_ref().map(|(dir, name)| dir.join(name));
        let file_layer = file.map(|(dir, name)| {
            fmt::layer()
                .with_writer(tracing_appender::rolling::never(dir, name))
                .with_ansi(false)
                .with_target(true)
        });

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(true),
            )
            .with(file_layer);

        Ok(Self {
            rank,
            level: level.to_string(),
            log_file,
            dispatch: Dispatch::new(subscriber),
        })
    }

    /// Routes this thread's events to the context until the guard drops.
    pub fn enter(&self) -> DefaultGuard {
        tracing::dispatcher::set_default(&self.dispatch)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_file_receives_events() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LogContext::with_file(3, "info", dir.path(), "1700000000").unwrap();
        let path = ctx.log_file().unwrap().to_path_buf();
        assert_eq!(path, dir.path().join("1700000000.rank3.log"));
        {
            let _guard = ctx.enter();
            tracing::warn!(target: TRAIN_TARGET, step = 1, "hello from rank three");
        }
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("hello from rank three"));
        assert!(content.contains(TRAIN_TARGET));
    }

    #[test]
    fn test_bad_level_is_configuration_error() {
        // RUST_LOG would take precedence; only check when it is unset.
        if std::env::var("RUST_LOG").is_err() {
            assert!(LogContext::new(0, "foo=notalevel").is_err());
        }
    }
}
