//! Kernel feature guard.
//!
//! While the console is locked, two global kernel behaviours are optionally
//! switched off: the SysRq trigger (a keyboard path into kernel debugging)
//! and verbose console printk (which would scribble over the lock prompt
//! and can leak information). Each toggle remembers the value it replaced
//! and restores it exactly once during unwind.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// One guarded kernel toggle backed by a procfs path.
///
/// `saved` is `None` until a successful read shows the feature active; a
/// toggle whose value was never saved is never written back, so an
/// unreadable or already-inert feature is left untouched by [`restore`].
///
/// [`restore`]: KernelToggle::restore
#[derive(Debug)]
pub struct KernelToggle {
    label: &'static str,
    path: PathBuf,
    delimiter: char,
    inert_max: i64,
    disabled_value: i64,
    saved: Option<i64>,
}

impl KernelToggle {
    /// Guard for the SysRq trigger: active when the value is above 0,
    /// disabled by writing 0.
    pub fn sysrq(path: impl Into<PathBuf>) -> Self {
        Self {
            label: "sysrq",
            path: path.into(),
            delimiter: '\n',
            inert_max: 0,
            disabled_value: 0,
            saved: None,
        }
    }

    /// Guard for the console log level: the first tab-separated printk
    /// field, active above 1, muted by writing 1.
    pub fn printk(path: impl Into<PathBuf>) -> Self {
        Self {
            label: "printk",
            path: path.into(),
            delimiter: '\t',
            inert_max: 1,
            disabled_value: 1,
            saved: None,
        }
    }

    /// Disable the feature if it is currently active, remembering the
    /// prior value for [`restore`](KernelToggle::restore).
    ///
    /// An unreadable or already-inert feature records "unset" and writes
    /// nothing; that is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error only when the disabling write fails. Callers treat
    /// this as fatal: proceeding half-secured is worse than not locking.
    pub fn engage(&mut self) -> io::Result<()> {
        let value = match read_leading_int(&self.path, self.delimiter) {
            Ok(v) => v,
            Err(e) => {
                debug!(feature = self.label, error = %e, "kernel feature unreadable, leaving untouched");
                self.saved = None;
                return Ok(());
            }
        };
        if value <= self.inert_max {
            self.saved = None;
            return Ok(());
        }
        write_int(&self.path, self.disabled_value)?;
        self.saved = Some(value);
        debug!(feature = self.label, prior = value, "kernel feature disabled");
        Ok(())
    }

    /// Write back the remembered value, if any. Safe to call repeatedly;
    /// only the first call after a successful [`engage`] performs a write.
    /// Failures are logged, never fatal: the rest of the unwind must run.
    ///
    /// [`engage`]: KernelToggle::engage
    pub fn restore(&mut self) {
        if let Some(value) = self.saved.take() {
            if let Err(e) = write_int(&self.path, value) {
                warn!(feature = self.label, value, error = %e, "failed to restore kernel feature");
            }
        }
    }
}

/// Read the leading integer field of a procfs file, terminated by
/// `delimiter` (or end of input).
fn read_leading_int(path: &Path, delimiter: char) -> io::Result<i64> {
    let data = std::fs::read_to_string(path)?;
    let token = data.split(delimiter).next().unwrap_or("").trim();
    token
        .parse::<i64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_int(path: &Path, value: i64) -> io::Result<()> {
    std::fs::write(path, format!("{value}\n"))
}
