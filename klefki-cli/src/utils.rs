//! Shared utility functions.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

/// Format a stored timestamp as a human-readable string.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Render a broker RFC 3339 timestamp for a table cell.
///
/// Empty means the machine never polled.
pub fn format_broker_time(raw: &str) -> String {
    if raw.is_empty() {
        return "never".to_string();
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| format_time(&dt.with_timezone(&Utc)))
        .unwrap_or_else(|_| raw.to_string())
}

/// Read a passphrase from `path`, or stdin when `None`.
///
/// A single trailing newline is dropped so `echo secret |` and files
/// written by editors seal the intended bytes.
pub fn read_passphrase(path: Option<&Path>) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::new());
    match path {
        Some(path) => {
            let mut file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            file.read_to_end(&mut buf)
                .with_context(|| format!("Failed to read {}", path.display()))?;
        }
        None => {
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read passphrase from stdin")?;
        }
    }

    strip_line_ending(&mut buf);
    Ok(buf)
}

fn strip_line_ending(buf: &mut Vec<u8>) {
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
}

/// Write secret material to a new file readable only by the owner.
pub fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    std::io::Write::write_all(&mut file, contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
