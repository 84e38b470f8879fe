#![allow(missing_docs)]

//! Straylight — lock the physical console until a password is entered.
//!
//! Resolves who may unlock up front, engages the kernel guard and the
//! terminal lock, then prompts on a freshly allocated virtual terminal
//! until the occupant (or root) authenticates or a termination signal
//! asks for an orderly release. Every exit path funnels through the
//! locker's unwind.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};

use straylight::auth::{self, CredentialVerifier, Identity, ShadowVerifier};
use straylight::config::{self, Settings, DEFAULT_CONFIG_PATH};
use straylight::kernel::KernelToggle;
use straylight::lock::{self, Locker, LoopOutcome};
use straylight::logging;
use straylight::vt::{ConsoleControl, VtConsole};

#[derive(Debug, Parser)]
#[command(
    name = "straylight",
    version,
    about = "Lock the physical console until a password is entered"
)]
struct Cli {
    /// Fork into the background before prompting.
    #[arg(short = 'd', long)]
    detach: bool,

    /// Disable the kernel SysRq trigger while locked.
    #[arg(short = 's', long)]
    disable_sysrq: bool,

    /// Mute kernel console messages while locked.
    #[arg(short = 'm', long)]
    mute_kernel: bool,

    /// Only lock terminal switching, then exit.
    #[arg(short = 'l', long, conflicts_with = "unlock_only")]
    lock_only: bool,

    /// Only unlock terminal switching, then exit.
    #[arg(short = 'L', long)]
    unlock_only: bool,

    /// Settings file path.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !nix::unistd::Uid::effective().is_root() {
        bail!("straylight must run as root");
    }

    let settings = config::load(&cli.config)?;

    if cli.lock_only || cli.unlock_only {
        logging::init_cli();
        return switch_lock_only(&settings, cli.lock_only);
    }

    let _logging = logging::init_production(&settings.log_dir)?;
    lock::install_signal_dispositions()?;

    let console = ConsoleControl::open(&settings.console_device)
        .context("failed to open the console control device")?;
    let origin_vt = console
        .current_vt()
        .context("failed to query the active terminal")?;

    let occupant = auth::occupant_of_vt(&settings.tty_base, origin_vt)
        .context("failed to resolve the console occupant")?;
    let verifier = ShadowVerifier::new(&settings.shadow_path);
    if !verifier.probe(&occupant) {
        bail!(
            "{} has no usable credential; refusing to lock an unopenable console",
            occupant.name
        );
    }
    let superuser = auth::superuser()
        .context("failed to resolve the superuser")?
        .filter(|su| su.name != occupant.name && verifier.probe(su));
    if superuser.is_none() {
        debug!("no distinct superuser escape path; occupant only");
    }
    info!(occupant = %occupant.name, vt = origin_vt, "locking console");

    let sysrq = cli
        .disable_sysrq
        .then(|| KernelToggle::sysrq(&settings.sysrq_path));
    let printk = cli
        .mute_kernel
        .then(|| KernelToggle::printk(&settings.printk_path));

    let mut locker = Locker::new(console, settings.clone(), origin_vt, sysrq, printk);
    let result = drive(&mut locker, &cli, &settings, &verifier, occupant, superuser);
    locker.unwind();
    result
}

/// Lock or unlock terminal switching and exit, touching nothing else.
fn switch_lock_only(settings: &Settings, engage: bool) -> Result<()> {
    let mut console = ConsoleControl::open(&settings.console_device)
        .context("failed to open the console control device")?;
    console
        .lock_switch(engage)
        .context("failed to change the terminal switch lock")?;
    if engage {
        info!("terminal switching locked");
    } else {
        info!("terminal switching unlocked");
    }
    console.close();
    Ok(())
}

/// The fallible middle of the lifecycle: engage, optionally detach, run
/// the auth loop. The caller unwinds regardless of the result.
fn drive<C: VtConsole>(
    locker: &mut Locker<C>,
    cli: &Cli,
    settings: &Settings,
    verifier: &ShadowVerifier,
    occupant: Identity,
    superuser: Option<Identity>,
) -> Result<()> {
    locker.engage()?;

    if lock::cancellation_requested() {
        info!("termination requested during setup, releasing");
        return Ok(());
    }

    if cli.detach {
        locker.detach()?;
    }

    let prompt = locker.prompt_source()?;
    let outcome = lock::drive_auth_loop(
        prompt,
        verifier,
        occupant,
        superuser,
        settings,
        lock::signal_channel,
    )?;

    match outcome {
        LoopOutcome::Unlocked(name) => info!(identity = %name, "console unlocked"),
        LoopOutcome::Cancelled => info!("lock cancelled by termination signal"),
    }
    Ok(())
}
