//! # Per-Node Event Files
//!
//! Every node appends one human-readable line per significant protocol event
//! to `outputfile_seed_<port>.txt` or `outputfile_peer_<port>.txt`. Lines
//! carry a Unix timestamp and the event kind; the same line is mirrored to
//! `tracing` for console observation. File write failures degrade to a log
//! warning; the event file must never take the node down.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

/// Seconds since the Unix epoch; also the protocol's timestamp field.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Append-only event file for one node.
pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    pub fn for_seed(dir: &Path, port: u16) -> std::io::Result<Self> {
        Self::open(dir.join(format!("outputfile_seed_{port}.txt")))
    }

    pub fn for_peer(dir: &Path, port: u16) -> std::io::Result<Self> {
        Self::open(dir.join(format!("outputfile_peer_{port}.txt")))
    }

    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one event line: `[<unix_ts>] <EVENT> <details>`.
    pub fn record(&self, event: &str, details: &str) {
        let ts = unix_now();
        debug!(event, details, "event");
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "[{ts}] {event} {details}") {
            warn!(error = %e, path = %self.path.display(), "event file write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gossamer-eventlog-{name}-{}", std::process::id()))
    }

    #[test]
    fn records_timestamped_lines() {
        let path = temp_path("basic");
        let log = EventLog::open(path.clone()).unwrap();
        log.record("LISTENING", "127.0.0.1:5001");
        log.record("COMMIT_ADD", "127.0.0.1:6001");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].contains("] LISTENING 127.0.0.1:5001"));
        assert!(lines[1].contains("COMMIT_ADD"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn appends_across_reopen() {
        let path = temp_path("reopen");
        {
            let log = EventLog::open(path.clone()).unwrap();
            log.record("LISTENING", "first");
        }
        {
            let log = EventLog::open(path.clone()).unwrap();
            log.record("LISTENING", "second");
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        std::fs::remove_file(path).ok();
    }
}
