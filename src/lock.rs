//! Lock orchestrator.
//!
//! Drives the end-to-end sequence: engage the kernel guard, acquire and
//! harden a fresh terminal, optionally detach into the background, run the
//! authentication retry loop, and unwind everything through a single
//! idempotent routine that every exit path funnels through.
//!
//! Termination signals are modelled as a cancellation channel rather than
//! arbitrary interruption: before the runtime exists they set an atomic
//! flag checked between lifecycle states; inside the auth loop they feed a
//! `watch` channel raced against the prompt read and the cooldown sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::{SigHandler, Signal};
use nix::unistd::ForkResult;
use tokio::signal::unix::{signal as tokio_signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::{CredentialVerifier, Identity, VerifyOutcome};
use crate::config::Settings;
use crate::kernel::KernelToggle;
use crate::trial::{ActiveIdentity, TrialState};
use crate::vt::{PromptSource, TerminalSession, TtyPrompt, VtConsole};

static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_termination(_: libc::c_int) {
    CANCELLED.store(true, Ordering::SeqCst);
}

/// Install the process's signal dispositions.
///
/// Signals that would let an interactive user suspend, interrupt or
/// background the process are ignored: once locked, no keyboard signal may
/// release the terminal early. Termination signals set the cancellation
/// flag observed between lifecycle states; the auth loop replaces them
/// with tokio signal streams feeding the cancellation channel.
///
/// # Errors
///
/// Returns an error when a disposition cannot be installed.
pub fn install_signal_dispositions() -> anyhow::Result<()> {
    let ignored = [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGTSTP,
    ];
    for sig in ignored {
        unsafe { nix::sys::signal::signal(sig, SigHandler::SigIgn) }
            .with_context(|| format!("failed to ignore {sig:?}"))?;
    }
    for sig in [Signal::SIGTERM, Signal::SIGQUIT] {
        unsafe { nix::sys::signal::signal(sig, SigHandler::Handler(note_termination)) }
            .with_context(|| format!("failed to install handler for {sig:?}"))?;
    }
    Ok(())
}

/// Whether a termination signal arrived before the auth loop started.
#[must_use]
pub fn cancellation_requested() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

/// Turn SIGTERM/SIGQUIT into a cancellation channel.
///
/// Must be called from within a tokio runtime. The receiver starts out
/// reflecting any signal that arrived during synchronous setup.
///
/// # Errors
///
/// Returns an error when the signal streams cannot be registered.
pub fn signal_channel() -> anyhow::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(CANCELLED.load(Ordering::SeqCst));
    let mut term =
        tokio_signal(SignalKind::terminate()).context("failed to register SIGTERM stream")?;
    let mut quit = tokio_signal(SignalKind::quit()).context("failed to register SIGQUIT stream")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = quit.recv() => {}
        }
        let _ = tx.send(true);
    });
    Ok(rx)
}

/// Resolves once the channel reports cancellation. Never resolves if the
/// sender is gone without having cancelled.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// How the authentication loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// A password matched; the named identity unlocked the console.
    Unlocked(String),
    /// A termination signal requested an orderly release.
    Cancelled,
}

/// Run the authentication retry loop against one or two candidate
/// identities.
///
/// Each iteration flushes pending input, prompts as the active identity,
/// reads a bounded password line (zeroed after use regardless of outcome)
/// and verifies it. Failures are audited, cooled down and fed through the
/// identity-switch policy. Verification `Error` outcomes take the same
/// branch as mismatches: the loop keeps prompting rather than giving up
/// the console.
///
/// # Errors
///
/// Returns an error only when the secured terminal itself fails; wrong
/// passwords are an expected branch, not errors.
pub async fn run_auth_loop<P, V>(
    mut prompt: P,
    verifier: &V,
    occupant: Identity,
    superuser: Option<Identity>,
    settings: &Settings,
    mut cancel: watch::Receiver<bool>,
) -> anyhow::Result<LoopOutcome>
where
    P: PromptSource,
    V: CredentialVerifier,
{
    let mut trial = TrialState::new(superuser.is_some(), settings.occupant_tries);
    loop {
        if *cancel.borrow() {
            return Ok(LoopOutcome::Cancelled);
        }
        prompt
            .discard_pending()
            .context("failed to flush pending console input")?;

        let who = match trial.active {
            ActiveIdentity::Occupant => &occupant,
            ActiveIdentity::Superuser => superuser.as_ref().unwrap_or(&occupant),
        };
        let name = who.name.clone();
        let text = format!("{name}'s password: ");

        let mut reader = prompt;
        let read = tokio::task::spawn_blocking(move || {
            let result = reader.read_password(&text);
            (reader, result)
        });
        let password = tokio::select! {
            joined = read => {
                let (reader, result) = joined.context("prompt reader task failed")?;
                prompt = reader;
                result.context("failed to read from the secured console")?
            }
            () = cancelled(&mut cancel) => return Ok(LoopOutcome::Cancelled),
        };

        let outcome = verifier.verify(who, &password);
        drop(password);

        if outcome == VerifyOutcome::Success {
            return Ok(LoopOutcome::Unlocked(name));
        }
        warn!(identity = %name, "authentication failure");
        if let Err(e) = prompt.notify_failure() {
            debug!(error = %e, "failed to write failure notice");
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(settings.cooldown_secs)) => {}
            () = cancelled(&mut cancel) => return Ok(LoopOutcome::Cancelled),
        }
        trial = trial.after_failure();
    }
}

/// Build a current-thread runtime, run [`run_auth_loop`] on it, and tear
/// the runtime down without waiting on a still-blocked prompt read.
///
/// `cancel_source` is invoked inside the runtime to produce the
/// cancellation channel; the lifecycle passes [`signal_channel`].
///
/// A cancelled loop leaves its `spawn_blocking` read parked in
/// `read_password` until the next keypress. Dropping the runtime would
/// join that worker, stalling the caller's unwind behind it;
/// `shutdown_background` releases the runtime without the join.
///
/// # Errors
///
/// Returns the runtime build error, the `cancel_source` error, or the
/// loop's own error.
pub fn drive_auth_loop<P, V, F>(
    prompt: P,
    verifier: &V,
    occupant: Identity,
    superuser: Option<Identity>,
    settings: &Settings,
    cancel_source: F,
) -> anyhow::Result<LoopOutcome>
where
    P: PromptSource,
    V: CredentialVerifier,
    F: FnOnce() -> anyhow::Result<watch::Receiver<bool>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;
    let outcome = runtime.block_on(async {
        let cancel = cancel_source()?;
        run_auth_loop(prompt, verifier, occupant, superuser, settings, cancel).await
    });
    runtime.shutdown_background();
    outcome
}

/// Owns every resource the lock acquires, in acquisition order, and tears
/// them down through one idempotent [`unwind`](Locker::unwind).
#[derive(Debug)]
pub struct Locker<C: VtConsole> {
    console: C,
    settings: Settings,
    origin_vt: u16,
    session: Option<TerminalSession>,
    sysrq: Option<KernelToggle>,
    printk: Option<KernelToggle>,
    switch_locked: bool,
}

impl<C: VtConsole> Locker<C> {
    /// A locker over an opened control device. `origin_vt` is the terminal
    /// to hand the display back to during unwind.
    pub fn new(
        console: C,
        settings: Settings,
        origin_vt: u16,
        sysrq: Option<KernelToggle>,
        printk: Option<KernelToggle>,
    ) -> Self {
        Self {
            console,
            settings,
            origin_vt,
            session: None,
            sysrq,
            printk,
            switch_locked: false,
        }
    }

    /// Engage the lock: disable the configured kernel features, acquire a
    /// fresh terminal, lock VT switching and harden the terminal mode.
    ///
    /// # Errors
    ///
    /// Any failure is fatal for the caller; the locker is left safe to
    /// [`unwind`](Locker::unwind) whatever subset was acquired.
    pub fn engage(&mut self) -> anyhow::Result<()> {
        if let Some(toggle) = self.sysrq.as_mut() {
            toggle.engage().context("failed to disable sysrq")?;
        }
        if let Some(toggle) = self.printk.as_mut() {
            toggle.engage().context("failed to mute kernel messages")?;
        }
        let session = TerminalSession::acquire(&self.console, &self.settings.tty_base)
            .context("failed to acquire a fresh terminal")?;
        self.session = Some(session);
        self.console
            .lock_switch(true)
            .context("failed to engage the VT switch lock")?;
        self.switch_locked = true;
        if let Some(session) = self.session.as_mut() {
            session
                .secure()
                .context("failed to harden the terminal mode")?;
        }
        Ok(())
    }

    /// Fork into a new session: the parent exits immediately without
    /// touching session resources; the child becomes a session leader,
    /// waits for the re-associated terminal to stabilise and rebinds its
    /// handle.
    ///
    /// # Errors
    ///
    /// Returns an error in the child when the new session or the rebind
    /// fails; the fork failure itself is also fatal.
    pub fn detach(&mut self) -> anyhow::Result<()> {
        match unsafe { nix::unistd::fork() }.context("fork failed")? {
            ForkResult::Parent { .. } => {
                // The child owns every acquired resource from here on;
                // exiting without destructors keeps the parent's hands off
                // them.
                std::process::exit(0);
            }
            ForkResult::Child => {
                nix::unistd::setsid().context("failed to start a new session")?;
                std::thread::sleep(Duration::from_millis(self.settings.detach_settle_ms));
                if let Some(session) = self.session.as_mut() {
                    session
                        .reopen()
                        .context("failed to rebind the session terminal")?;
                }
                Ok(())
            }
        }
    }

    /// A prompt over the secured terminal.
    ///
    /// # Errors
    ///
    /// Returns an error when no session is held or the handle cannot be
    /// duplicated.
    pub fn prompt_source(&self) -> anyhow::Result<TtyPrompt> {
        let session = self
            .session
            .as_ref()
            .context("no terminal session to prompt on")?;
        session
            .prompt_source()
            .context("failed to open a prompt on the secured terminal")
    }

    /// Release everything, in order: restore the printk toggle, restore
    /// the sysrq toggle, reset the secured terminal, disengage the switch
    /// lock, hand the display back to the original terminal (closing and
    /// deallocating the session's), and close the control device.
    ///
    /// Safe with any subset of resources acquired, safe to invoke more
    /// than once, and every step runs even when an earlier one fails.
    pub fn unwind(&mut self) {
        if let Some(toggle) = self.printk.as_mut() {
            toggle.restore();
        }
        if let Some(toggle) = self.sysrq.as_mut() {
            toggle.restore();
        }
        if let Some(session) = self.session.as_mut() {
            session.reset();
        }
        if self.switch_locked {
            if let Err(e) = self.console.lock_switch(false) {
                warn!(error = %e, "failed to disengage the VT switch lock");
            }
            self.switch_locked = false;
        }
        if let Some(session) = self.session.as_mut() {
            if !session.release(&self.console, self.origin_vt) {
                warn!("terminal release was incomplete");
            }
        }
        self.console.close();
        info!("lock state released");
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        console: C,
        settings: Settings,
        origin_vt: u16,
        session: Option<TerminalSession>,
        sysrq: Option<KernelToggle>,
        printk: Option<KernelToggle>,
        switch_locked: bool,
    ) -> Self {
        Self {
            console,
            settings,
            origin_vt,
            session,
            sysrq,
            printk,
            switch_locked,
        }
    }

    #[cfg(test)]
    pub(crate) fn console(&self) -> &C {
        &self.console
    }
}

impl<C: VtConsole> Drop for Locker<C> {
    fn drop(&mut self) {
        self.unwind();
    }
}
