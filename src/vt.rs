//! Terminal session controller.
//!
//! Owns the two kernel-facing terminal resources: the single console
//! control device (`/dev/console`), through which every VT query, switch
//! and switch-lock goes, and the one freshly allocated terminal the lock
//! lives on. Acquisition is fatal-on-failure; release and reset are
//! best-effort so the unwind can always finish.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sys::termios::{self, FlushArg, LocalFlags, SetArg, Termios};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Upper bound on a password line read from the console, in bytes.
/// Input beyond this is discarded rather than grown.
pub const MAX_PASSWORD_BYTES: usize = 1024;

/// Errors from console and terminal-session operations.
#[derive(Debug, thiserror::Error)]
pub enum VtError {
    /// The control device has already been closed (or never opened).
    #[error("console control device is not open")]
    ControlClosed,

    /// A device node could not be opened.
    #[error("{path}: {source}")]
    Open {
        /// The device path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A VT ioctl failed.
    #[error("{op}: {source}")]
    Ioctl {
        /// The ioctl that failed.
        op: &'static str,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// The kernel reported no free terminal to allocate.
    #[error("no free virtual terminal available")]
    NoFreeVt,

    /// Terminal attributes could not be read or written.
    #[error("terminal attributes: {source}")]
    Termios {
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// An operation that needs an acquired session found none.
    #[error("no terminal session")]
    NoSession,
}

/// VT ioctl bindings. Request numbers are from `<linux/vt.h>`.
mod ioctl {
    use super::VtStat;

    const VT_OPENQRY: libc::c_int = 0x5600;
    const VT_GETSTATE: libc::c_int = 0x5603;
    const VT_ACTIVATE: libc::c_int = 0x5606;
    const VT_WAITACTIVE: libc::c_int = 0x5607;
    const VT_DISALLOCATE: libc::c_int = 0x5608;
    const VT_LOCKSWITCH: libc::c_int = 0x560B;
    const VT_UNLOCKSWITCH: libc::c_int = 0x560C;

    nix::ioctl_read_bad!(vt_openqry, VT_OPENQRY, libc::c_int);
    nix::ioctl_read_bad!(vt_getstate, VT_GETSTATE, VtStat);
    nix::ioctl_write_int_bad!(vt_activate, VT_ACTIVATE);
    nix::ioctl_write_int_bad!(vt_waitactive, VT_WAITACTIVE);
    nix::ioctl_write_int_bad!(vt_disallocate, VT_DISALLOCATE);
    nix::ioctl_write_int_bad!(vt_lockswitch, VT_LOCKSWITCH);
    nix::ioctl_write_int_bad!(vt_unlockswitch, VT_UNLOCKSWITCH);
}

/// Mirror of `struct vt_stat` from `<linux/vt.h>`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

/// Operations on the console-switching control interface.
///
/// This is the seam between the orchestrator and the kernel: the real
/// implementation is [`ConsoleControl`]; tests substitute a recording fake.
pub trait VtConsole {
    /// Number of the currently active terminal.
    fn current_vt(&self) -> Result<u16, VtError>;

    /// Ask the kernel for an unused terminal number.
    fn query_free_vt(&self) -> Result<u16, VtError>;

    /// Switch the display to `nr`, blocking until the switch completes.
    /// Interrupted waits are retried; real failures are returned.
    fn activate(&self, nr: u16) -> Result<(), VtError>;

    /// Engage or disengage the kernel-level lock on terminal switching.
    fn lock_switch(&self, engage: bool) -> Result<(), VtError>;

    /// Deallocate terminal `nr` so it is not left dangling.
    fn disallocate(&self, nr: u16) -> Result<(), VtError>;

    /// Close the control handle. Idempotent.
    fn close(&mut self);
}

/// The single process-wide handle to the console control device.
#[derive(Debug)]
pub struct ConsoleControl {
    path: PathBuf,
    device: Option<File>,
}

impl ConsoleControl {
    /// Open the control device. Without it no VT operation is meaningful,
    /// so callers treat failure as fatal.
    ///
    /// # Errors
    ///
    /// Returns [`VtError::Open`] when the device cannot be opened.
    pub fn open(path: &Path) -> Result<Self, VtError> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| VtError::Open {
                path: path.display().to_string(),
                source: e,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            device: Some(device),
        })
    }

    fn fd(&self) -> Result<libc::c_int, VtError> {
        self.device
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or(VtError::ControlClosed)
    }
}

impl VtConsole for ConsoleControl {
    fn current_vt(&self) -> Result<u16, VtError> {
        let fd = self.fd()?;
        let mut state = VtStat::default();
        unsafe { ioctl::vt_getstate(fd, &mut state) }.map_err(|e| VtError::Ioctl {
            op: "VT_GETSTATE",
            source: e,
        })?;
        Ok(state.v_active)
    }

    fn query_free_vt(&self) -> Result<u16, VtError> {
        let fd = self.fd()?;
        let mut nr: libc::c_int = -1;
        unsafe { ioctl::vt_openqry(fd, &mut nr) }.map_err(|e| VtError::Ioctl {
            op: "VT_OPENQRY",
            source: e,
        })?;
        u16::try_from(nr).map_err(|_| VtError::NoFreeVt)
    }

    fn activate(&self, nr: u16) -> Result<(), VtError> {
        let fd = self.fd()?;
        let target = libc::c_int::from(nr);
        unsafe { ioctl::vt_activate(fd, target) }.map_err(|e| VtError::Ioctl {
            op: "VT_ACTIVATE",
            source: e,
        })?;
        loop {
            match unsafe { ioctl::vt_waitactive(fd, target) } {
                Ok(_) => return Ok(()),
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    return Err(VtError::Ioctl {
                        op: "VT_WAITACTIVE",
                        source: e,
                    })
                }
            }
        }
    }

    fn lock_switch(&self, engage: bool) -> Result<(), VtError> {
        let fd = self.fd()?;
        if engage {
            unsafe { ioctl::vt_lockswitch(fd, 1) }.map_err(|e| VtError::Ioctl {
                op: "VT_LOCKSWITCH",
                source: e,
            })?;
        } else {
            unsafe { ioctl::vt_unlockswitch(fd, 1) }.map_err(|e| VtError::Ioctl {
                op: "VT_UNLOCKSWITCH",
                source: e,
            })?;
        }
        Ok(())
    }

    fn disallocate(&self, nr: u16) -> Result<(), VtError> {
        let fd = self.fd()?;
        unsafe { ioctl::vt_disallocate(fd, libc::c_int::from(nr)) }.map_err(|e| VtError::Ioctl {
            op: "VT_DISALLOCATE",
            source: e,
        })?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            debug!(path = %self.path.display(), "closing console control device");
            drop(device);
        }
    }
}

/// One freshly allocated terminal, exclusively owned for the process's
/// lifetime.
///
/// `nr` and `handle` are set together by [`acquire`] and cleared together
/// by [`release`]; the session never holds a device handle without its
/// terminal number.
///
/// [`acquire`]: TerminalSession::acquire
/// [`release`]: TerminalSession::release
#[derive(Debug)]
pub struct TerminalSession {
    nr: Option<u16>,
    handle: Option<File>,
    saved: Option<Termios>,
    tty_base: String,
}

impl TerminalSession {
    /// Allocate a fresh terminal, open its device node, switch the display
    /// to it and capture its mode flags for later restoration.
    ///
    /// # Errors
    ///
    /// Any failure is returned as-is; the lock has no terminal to secure,
    /// so callers treat this as fatal.
    pub fn acquire(console: &dyn VtConsole, tty_base: &str) -> Result<Self, VtError> {
        let nr = console.query_free_vt()?;
        let path = format!("{tty_base}{nr}");
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| VtError::Open {
                path: path.clone(),
                source: e,
            })?;
        console.activate(nr)?;
        let saved = termios::tcgetattr(&handle).map_err(|e| VtError::Termios { source: e })?;
        debug!(vt = nr, "acquired terminal");
        Ok(Self {
            nr: Some(nr),
            handle: Some(handle),
            saved: Some(saved),
            tty_base: tty_base.to_owned(),
        })
    }

    /// Re-open the session's device node in place.
    ///
    /// Used only after detaching into a new session group, when the handle
    /// must be rebound to the re-associated terminal.
    ///
    /// # Errors
    ///
    /// Returns [`VtError::NoSession`] without an acquired terminal, or
    /// [`VtError::Open`] when the node cannot be re-opened; both are fatal
    /// for the caller.
    pub fn reopen(&mut self) -> Result<(), VtError> {
        let nr = self.nr.ok_or(VtError::NoSession)?;
        let path = format!("{}{nr}", self.tty_base);
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| VtError::Open {
                path: path.clone(),
                source: e,
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Harden the terminal mode: no input echo, no signal-generating
    /// keystrokes. The password cannot be echoed back and the lock cannot
    /// be escaped via keyboard signals.
    ///
    /// # Errors
    ///
    /// Returns an error when the attributes cannot be applied.
    pub fn secure(&mut self) -> Result<(), VtError> {
        let handle = self.handle.as_ref().ok_or(VtError::NoSession)?;
        let saved = self.saved.as_ref().ok_or(VtError::NoSession)?;
        let mut hardened = saved.clone();
        hardened
            .local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ISIG);
        termios::tcsetattr(handle, SetArg::TCSANOW, &hardened)
            .map_err(|e| VtError::Termios { source: e })
    }

    /// Clear the terminal and restore the captured mode flags.
    /// Best-effort: failures are logged and swallowed.
    pub fn reset(&mut self) {
        let Some(mut handle) = self.handle.as_ref() else {
            return;
        };
        if let Err(e) = write!(handle, "\x1b[H\x1b[J") {
            debug!(error = %e, "failed to clear the terminal");
        }
        if let Some(saved) = self.saved.as_ref() {
            if let Err(e) = termios::tcsetattr(handle, SetArg::TCSANOW, saved) {
                warn!(error = %e, "failed to restore terminal attributes");
            }
        }
    }

    /// Switch the display back to `target`, close the device handle and
    /// deallocate the owned terminal number.
    ///
    /// Every step is attempted even when an earlier one fails; the return
    /// value reports whether all of them succeeded. Calling this on an
    /// already-released session is a no-op.
    pub fn release(&mut self, console: &dyn VtConsole, target: u16) -> bool {
        if self.nr.is_none() && self.handle.is_none() {
            return true;
        }
        let mut ok = true;
        if let Err(e) = console.activate(target) {
            warn!(target, error = %e, "failed to reactivate the original terminal");
            ok = false;
        }
        if let Some(handle) = self.handle.take() {
            drop(handle);
        }
        if let Some(nr) = self.nr.take() {
            if let Err(e) = console.disallocate(nr) {
                warn!(vt = nr, error = %e, "failed to deallocate the terminal");
                ok = false;
            }
        }
        ok
    }

    /// A [`PromptSource`] reading from this session's terminal.
    ///
    /// # Errors
    ///
    /// Returns [`VtError::NoSession`] without an acquired terminal, or
    /// [`VtError::Open`] when the handle cannot be duplicated.
    pub fn prompt_source(&self) -> Result<TtyPrompt, VtError> {
        let handle = self.handle.as_ref().ok_or(VtError::NoSession)?;
        let file = handle.try_clone().map_err(|e| VtError::Open {
            path: format!("{}{}", self.tty_base, self.nr.unwrap_or_default()),
            source: e,
        })?;
        Ok(TtyPrompt { file })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(nr: Option<u16>, tty_base: &str) -> Self {
        Self {
            nr,
            handle: None,
            saved: None,
            tty_base: tty_base.to_owned(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.nr.is_none() && self.handle.is_none()
    }
}

/// Where the auth loop prompts for and reads passwords.
///
/// The real implementation is [`TtyPrompt`] over the secured terminal;
/// tests substitute scripted fakes.
pub trait PromptSource: Send + 'static {
    /// Write `prompt` and read one password line. The returned buffer is
    /// zeroed on drop.
    ///
    /// # Errors
    ///
    /// Returns an error when the terminal cannot be read; the loop treats
    /// that as fatal.
    fn read_password(&mut self, prompt: &str) -> io::Result<Zeroizing<Vec<u8>>>;

    /// Tell the user the attempt failed.
    ///
    /// # Errors
    ///
    /// Returns an error when the terminal cannot be written.
    fn notify_failure(&mut self) -> io::Result<()>;

    /// Discard buffered pending input so a queued keystroke sequence
    /// cannot pre-fill the next prompt.
    ///
    /// # Errors
    ///
    /// Returns an error when the terminal cannot be flushed.
    fn discard_pending(&mut self) -> io::Result<()>;
}

/// Prompt over the secured terminal's device handle.
#[derive(Debug)]
pub struct TtyPrompt {
    file: File,
}

impl PromptSource for TtyPrompt {
    fn read_password(&mut self, prompt: &str) -> io::Result<Zeroizing<Vec<u8>>> {
        write!(&self.file, "{prompt}")?;
        (&self.file).flush()?;
        read_line_bounded(&self.file, MAX_PASSWORD_BYTES)
    }

    fn notify_failure(&mut self) -> io::Result<()> {
        write!(&self.file, "\nAuthentication failed\n\n")?;
        (&self.file).flush()
    }

    fn discard_pending(&mut self) -> io::Result<()> {
        termios::tcflush(&self.file, FlushArg::TCIFLUSH).map_err(io::Error::other)
    }
}

/// Read one line into a zeroed-on-drop buffer: stops at newline or EOF,
/// skips embedded NUL bytes, and silently discards input beyond `limit`.
///
/// The buffer is preallocated at `limit` and never grows: a `Vec`
/// reallocation would copy the partial password into a fresh allocation
/// and free the old bytes unzeroed.
fn read_line_bounded<R: Read>(mut reader: R, limit: usize) -> io::Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::with_capacity(limit));
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        if byte[0] == 0 {
            continue;
        }
        if buf.len() < limit {
            buf.push(byte[0]);
        }
    }
    Ok(buf)
}
