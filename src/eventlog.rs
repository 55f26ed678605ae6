//! # Diagnostics Event Log
//!
//! Optional append-only log of tagged engine events, one line per event:
//!
//! ```text
//! TAG(args);\n
//! ```
//!
//! Binary arguments are rendered with [`escape`], which quotes printable
//! ASCII and emits `\xNN` for everything else, capped at 512 raw bytes per
//! argument. The log file lives next to the database as `<name>.elog`; when
//! that cannot be opened a best-effort `lost+found.elog` is tried. An empty
//! name selects the in-memory default `burrowdb-inmem`.
//!
//! The log keeps its own lock so diagnostic paths may append without holding
//! the engine lock. It is injected where needed rather than reached through
//! a global.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use hashbrown::HashMap;
use parking_lot::Mutex;

/// Name used when the caller passes an empty filename (in-memory databases).
pub const DEFAULT_LOG_NAME: &str = "burrowdb-inmem";

/// Raw bytes of a single argument rendered into a log line, at most.
const ESCAPE_CAP: usize = 512;

/// Append-only diagnostics log with an internal lock.
#[derive(Default)]
pub struct EventLog {
    files: Mutex<HashMap<String, File>>,
}

fn normalize(filename: &str) -> &str {
    if filename.is_empty() {
        DEFAULT_LOG_NAME
    } else {
        filename
    }
}

fn path_from_filename(filename: &str) -> PathBuf {
    PathBuf::from(format!("{}.elog", filename))
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (truncates) the log for `filename`.
    pub fn create(&self, filename: &str) {
        self.open_or_create(filename, true);
    }

    /// Opens the log for `filename`, appending to existing content.
    pub fn open(&self, filename: &str) {
        self.open_or_create(filename, false);
    }

    fn open_or_create(&self, filename: &str, truncate: bool) {
        let filename = normalize(filename);
        let mut files = self.files.lock();

        let path = path_from_filename(filename);
        let mut opts = OpenOptions::new();
        opts.create(true).write(true);
        if truncate {
            opts.truncate(true);
        } else {
            opts.append(true);
        }

        let file = match opts.open(&path) {
            Ok(f) => f,
            Err(_) => {
                // best effort: divert to a catch-all log
                match opts.open("lost+found.elog") {
                    Ok(f) => f,
                    Err(_) => return,
                }
            }
        };
        files.insert(filename.to_string(), file);
    }

    pub fn close(&self, filename: &str) {
        let filename = normalize(filename);
        self.files.lock().remove(filename);
    }

    /// Appends one `TAG(args);` line. Opens the log on demand.
    pub fn append(&self, filename: &str, tag: &str, args: &str) {
        let filename = normalize(filename);

        if !self.files.lock().contains_key(filename) {
            self.open(filename);
        }

        let mut files = self.files.lock();
        if let Some(file) = files.get_mut(filename) {
            let _ = writeln!(file, "{}({});", tag, args);
            let _ = file.flush();
        }
    }
}

/// Renders binary data as a quoted string, escaping non-ASCII bytes as
/// `\xNN`. Input is truncated to 512 bytes.
pub fn escape(data: &[u8]) -> String {
    let data = &data[..data.len().min(ESCAPE_CAP)];
    let mut out = String::with_capacity(data.len() + 2);
    out.push('"');
    for &b in data {
        if b.is_ascii() && !b.is_ascii_control() {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\x{:02x}", b);
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn escape_passes_printable_ascii() {
        assert_eq!(escape(b"hello"), "\"hello\"");
    }

    #[test]
    fn escape_hexes_binary_bytes() {
        assert_eq!(escape(&[0x00, b'a', 0xFF]), "\"\\x00a\\xff\"");
    }

    #[test]
    fn escape_caps_input_length() {
        let data = vec![b'x'; 2000];
        let escaped = escape(&data);
        // 512 bytes plus the surrounding quotes
        assert_eq!(escaped.len(), 514);
    }

    #[test]
    fn empty_filename_uses_default_name() {
        assert_eq!(normalize(""), DEFAULT_LOG_NAME);
        assert_eq!(normalize("db1"), "db1");
    }

    #[test]
    fn append_writes_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("events").to_string_lossy().into_owned();

        let log = EventLog::new();
        log.create(&name);
        log.append(&name, "insert", &escape(b"key1"));
        log.append(&name, "erase", &escape(b"key1"));
        log.close(&name);

        let content = fs::read_to_string(path_from_filename(&name)).unwrap();
        assert_eq!(content, "insert(\"key1\");\nerase(\"key1\");\n");
    }

    #[test]
    fn append_opens_log_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("lazy").to_string_lossy().into_owned();

        let log = EventLog::new();
        log.append(&name, "open", "1");

        assert!(path_from_filename(&name).exists());
    }
}
