//! # Logging Setup
//!
//! Installs the process-wide `tracing` subscriber used by the binaries:
//! a console layer, a plain-text file layer written off the hot path by a
//! non-blocking appender, and an `EnvFilter` (`RUST_LOG` wins over the
//! configured level). Records emitted through the `log` facade by the core
//! modules are bridged into the same subscriber.
//!
//! Every start writes a fresh `<app>_<timestamp>.log`; older files of the same
//! application are pruned so only the newest previous run is kept.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("log directory error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("a global subscriber is already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Sets up console and file logging. Keep the returned guard alive for the
/// lifetime of the process, dropping it flushes the file writer.
pub fn setup_logging(app_name: &str, log_dir: &Path, level: &str) -> Result<WorkerGuard, LoggerError> {
    fs::create_dir_all(log_dir)?;
    cleanup_old_logs(app_name, log_dir)?;

    let file_name = log_file_name(app_name);
    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, &file_name));

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()?;

    tracing::info!("Logging to {}", log_dir.join(&file_name).display());
    Ok(guard)
}

const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

fn log_file_name(app_name: &str) -> String {
    format!("{}_{}.log", app_name, chrono::Local::now().format(LOG_TIMESTAMP_FORMAT))
}

/// True for `<app>_<timestamp>.log` only. A longer app name sharing the
/// prefix (`har` vs `har_broker`) does not parse as a timestamp.
fn is_log_of(app_name: &str, file_name: &str) -> bool {
    file_name
        .strip_prefix(app_name)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(".log"))
        .is_some_and(|stamp| chrono::NaiveDateTime::parse_from_str(stamp, LOG_TIMESTAMP_FORMAT).is_ok())
}

/// Deletes all but the newest `<app>_<timestamp>.log` file in `log_dir`. File
/// names carry a sortable timestamp, so newest means greatest name. Returns
/// how many files were removed.
pub fn cleanup_old_logs(app_name: &str, log_dir: &Path) -> io::Result<usize> {
    let mut logs: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| is_log_of(app_name, name))
        })
        .collect();

    logs.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old in logs.iter().skip(1) {
        match fs::remove_file(old) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {}", old.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_keeps_only_newest_log_of_the_app() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "gateway_2024-01-01_10-00-00.log",
            "gateway_2024-03-01_10-00-00.log",
            "gateway_2024-02-01_10-00-00.log",
            "relay_2023-01-01_10-00-00.log",
            "gateway_notes.txt",
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        assert_eq!(cleanup_old_logs("gateway", dir.path()).unwrap(), 2);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "gateway_2024-03-01_10-00-00.log",
                "gateway_notes.txt",
                "relay_2023-01-01_10-00-00.log",
            ]
        );
    }

    #[test]
    fn cleanup_leaves_apps_sharing_a_name_prefix_alone() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "har_2024-01-01_10-00-00.log",
            "har_2024-02-01_10-00-00.log",
            "har_broker_2024-01-01_10-00-00.log",
            "har_broker_2024-02-01_10-00-00.log",
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        assert_eq!(cleanup_old_logs("har", dir.path()).unwrap(), 1);
        assert!(!dir.path().join("har_2024-01-01_10-00-00.log").exists());
        assert!(dir.path().join("har_2024-02-01_10-00-00.log").exists());
        assert!(dir.path().join("har_broker_2024-01-01_10-00-00.log").exists());
        assert!(dir.path().join("har_broker_2024-02-01_10-00-00.log").exists());
    }

    #[test]
    fn generated_file_names_are_recognised_for_cleanup() {
        assert!(is_log_of("har_broker", &log_file_name("har_broker")));
        assert!(!is_log_of("har", &log_file_name("har_broker")));
    }

    #[test]
    fn file_name_embeds_app_and_sortable_timestamp() {
        let name = log_file_name("har_broker");
        assert!(name.starts_with("har_broker_"));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "har_broker_".len() + "2024-01-01_10-00-00".len() + ".log".len());
    }
}
