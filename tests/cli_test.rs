//! Surface-level CLI checks. Nothing here touches a real console: only
//! argument parsing paths that exit before any privileged work.

use assert_cmd::Command;

fn straylight() -> Command {
    Command::cargo_bin("straylight").expect("binary under test")
}

#[test]
fn help_lists_every_mode_flag() {
    let output = straylight().arg("--help").output().expect("run --help");
    assert!(output.status.success());
    let help = String::from_utf8(output.stdout).expect("utf8 help text");
    for flag in [
        "--detach",
        "--disable-sysrq",
        "--mute-kernel",
        "--lock-only",
        "--unlock-only",
        "--config",
    ] {
        assert!(help.contains(flag), "help is missing {flag}: {help}");
    }
}

#[test]
fn version_reports_the_package_version() {
    let output = straylight().arg("--version").output().expect("run --version");
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout).expect("utf8 version text");
    assert!(text.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn lock_only_and_unlock_only_are_mutually_exclusive() {
    let output = straylight()
        .args(["-l", "-L"])
        .output()
        .expect("run with conflicting flags");
    assert!(!output.status.success());
    let err = String::from_utf8(output.stderr).expect("utf8 error text");
    assert!(err.contains("cannot be used with"), "unexpected stderr: {err}");
}
