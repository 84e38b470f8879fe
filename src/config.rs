//! Settings loading and validation.
//!
//! Straylight runs with compiled-in defaults; an optional TOML file
//! (default `/etc/straylight.toml`) may override any subset of them.
//! Command-line flags decide *which* features run, the settings file
//! decides *where* and *how fast*.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/straylight.toml";

/// Runtime settings for the lock lifecycle.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Console-switching control device.
    #[serde(default = "default_console_device")]
    pub console_device: PathBuf,

    /// Terminal device path prefix; the allocated VT number is appended.
    #[serde(default = "default_tty_base")]
    pub tty_base: String,

    /// Kernel SysRq toggle path (single integer, newline-terminated).
    #[serde(default = "default_sysrq_path")]
    pub sysrq_path: PathBuf,

    /// Kernel printk toggle path (first field is tab-terminated).
    #[serde(default = "default_printk_path")]
    pub printk_path: PathBuf,

    /// Shadow-format credential store consulted by the verifier.
    #[serde(default = "default_shadow_path")]
    pub shadow_path: PathBuf,

    /// Cooldown after a failed attempt, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Consecutive occupant failures before the superuser path is offered.
    #[serde(default = "default_occupant_tries")]
    pub occupant_tries: u32,

    /// Delay before rebinding the terminal after detaching, in milliseconds.
    #[serde(default = "default_detach_settle_ms")]
    pub detach_settle_ms: u64,

    /// Directory for the JSON audit log.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            console_device: default_console_device(),
            tty_base: default_tty_base(),
            sysrq_path: default_sysrq_path(),
            printk_path: default_printk_path(),
            shadow_path: default_shadow_path(),
            cooldown_secs: default_cooldown_secs(),
            occupant_tries: default_occupant_tries(),
            detach_settle_ms: default_detach_settle_ms(),
            log_dir: default_log_dir(),
        }
    }
}

/// Load settings from `path`, falling back to defaults when the file does
/// not exist.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load(path: &Path) -> anyhow::Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn default_console_device() -> PathBuf {
    PathBuf::from("/dev/console")
}

fn default_tty_base() -> String {
    String::from("/dev/tty")
}

fn default_sysrq_path() -> PathBuf {
    PathBuf::from("/proc/sys/kernel/sysrq")
}

fn default_printk_path() -> PathBuf {
    PathBuf::from("/proc/sys/kernel/printk")
}

fn default_shadow_path() -> PathBuf {
    PathBuf::from("/etc/shadow")
}

fn default_cooldown_secs() -> u64 {
    3
}

fn default_occupant_tries() -> u32 {
    3
}

fn default_detach_settle_ms() -> u64 {
    1000
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/straylight")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = load(Path::new("/nonexistent/straylight.toml")).expect("load");
        assert_eq!(settings.console_device, PathBuf::from("/dev/console"));
        assert_eq!(settings.cooldown_secs, 3);
        assert_eq!(settings.occupant_tries, 3);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "cooldown_secs = 7\ntty_base = \"/dev/pts/\"").expect("write");
        let settings = load(file.path()).expect("load");
        assert_eq!(settings.cooldown_secs, 7);
        assert_eq!(settings.tty_base, "/dev/pts/");
        assert_eq!(settings.occupant_tries, 3);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "cooldown_secs = \"not a number\"").expect("write");
        assert!(load(file.path()).is_err());
    }
}
