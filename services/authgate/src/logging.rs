//! Logging initialization.
//!
//! With a log file configured, events are written to it as JSON lines and,
//! unless running daemonized, echoed to stderr in compact form. Without a
//! log file, JSON goes to stderr.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Open `path` for appending, creating parent directories as needed.
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str, log_file: Option<&Path>, daemonize: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match log_file {
        Some(path) => {
            let file = open_log_file(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let json_stderr = log_file.is_none().then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
    });

    let compact_stderr = (log_file.is_some() && !daemonize).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(json_stderr)
        .with(compact_stderr)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::tempdir;

    #[test]
    fn test_open_log_file_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/logs/authgate.log");

        let mut file = open_log_file(&path).unwrap();
        file.write_all(b"first\n").unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_open_log_file_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("authgate.log");

        open_log_file(&path).unwrap().write_all(b"one\n").unwrap();
        open_log_file(&path).unwrap().write_all(b"two\n").unwrap();

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }
}
