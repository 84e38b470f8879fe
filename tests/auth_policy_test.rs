//! End-to-end tests of the authentication loop policy, using scripted
//! prompt and verifier fakes in place of the real terminal and shadow
//! store.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use zeroize::Zeroizing;

use straylight::auth::{CredentialVerifier, Identity, VerifyOutcome};
use straylight::config::Settings;
use straylight::lock::{drive_auth_loop, run_auth_loop, LoopOutcome};
use straylight::vt::PromptSource;

/// Replays a fixed sequence of password entries and records every prompt
/// it was shown.
struct ScriptedPrompt {
    replies: VecDeque<&'static [u8]>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPrompt {
    fn new(replies: &[&'static [u8]]) -> (Self, Arc<Mutex<Vec<String>>>) {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let source = Self {
            replies: replies.iter().copied().collect(),
            prompts: Arc::clone(&prompts),
        };
        (source, prompts)
    }
}

impl PromptSource for ScriptedPrompt {
    fn read_password(&mut self, prompt: &str) -> io::Result<Zeroizing<Vec<u8>>> {
        self.prompts
            .lock()
            .expect("prompt log poisoned")
            .push(prompt.to_owned());
        let reply = self
            .replies
            .pop_front()
            .ok_or_else(|| io::Error::other("script exhausted"))?;
        Ok(Zeroizing::new(reply.to_vec()))
    }

    fn notify_failure(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn discard_pending(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Verifier over an in-memory name/password map. Empty passwords are
/// mismatches for known names, mirroring the probe contract.
struct MapVerifier {
    passwords: HashMap<String, &'static [u8]>,
}

impl MapVerifier {
    fn new(entries: &[(&str, &'static [u8])]) -> Self {
        Self {
            passwords: entries
                .iter()
                .map(|(name, pw)| ((*name).to_owned(), *pw))
                .collect(),
        }
    }
}

impl CredentialVerifier for MapVerifier {
    fn verify(&self, who: &Identity, password: &[u8]) -> VerifyOutcome {
        match self.passwords.get(&who.name) {
            None => VerifyOutcome::Error,
            Some(_) if password.is_empty() => VerifyOutcome::Mismatch,
            Some(expected) if *expected == password => VerifyOutcome::Success,
            Some(_) => VerifyOutcome::Mismatch,
        }
    }
}

fn identity(name: &str) -> Identity {
    Identity {
        name: name.to_owned(),
    }
}

fn fast_settings() -> Settings {
    Settings {
        cooldown_secs: 0,
        occupant_tries: 3,
        ..Settings::default()
    }
}

fn live_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[tokio::test]
async fn first_attempt_success_unlocks_as_the_occupant() {
    let (prompt, prompts) = ScriptedPrompt::new(&[b"open sesame"]);
    let verifier = MapVerifier::new(&[("case", b"open sesame"), ("root", b"wintermute")]);
    let (_tx, cancel) = live_cancel();

    let outcome = run_auth_loop(
        prompt,
        &verifier,
        identity("case"),
        Some(identity("root")),
        &fast_settings(),
        cancel,
    )
    .await
    .expect("loop");

    assert_eq!(outcome, LoopOutcome::Unlocked(String::from("case")));
    assert_eq!(
        prompts.lock().expect("prompt log").as_slice(),
        &[String::from("case's password: ")]
    );
}

#[tokio::test]
async fn three_occupant_failures_offer_root_then_bounce_back() {
    let (prompt, prompts) = ScriptedPrompt::new(&[
        b"wrong1",
        b"wrong2",
        b"wrong3",
        b"wrong4", // root's turn, also wrong
        b"open sesame",
    ]);
    let verifier = MapVerifier::new(&[("case", b"open sesame"), ("root", b"wintermute")]);
    let (_tx, cancel) = live_cancel();

    let outcome = run_auth_loop(
        prompt,
        &verifier,
        identity("case"),
        Some(identity("root")),
        &fast_settings(),
        cancel,
    )
    .await
    .expect("loop");

    assert_eq!(outcome, LoopOutcome::Unlocked(String::from("case")));
    let seen = prompts.lock().expect("prompt log").clone();
    assert_eq!(
        seen,
        vec![
            String::from("case's password: "),
            String::from("case's password: "),
            String::from("case's password: "),
            String::from("root's password: "),
            String::from("case's password: "),
        ]
    );
}

#[tokio::test]
async fn root_can_unlock_when_its_turn_comes() {
    let (prompt, _prompts) = ScriptedPrompt::new(&[b"a", b"b", b"c", b"wintermute"]);
    let verifier = MapVerifier::new(&[("case", b"open sesame"), ("root", b"wintermute")]);
    let (_tx, cancel) = live_cancel();

    let outcome = run_auth_loop(
        prompt,
        &verifier,
        identity("case"),
        Some(identity("root")),
        &fast_settings(),
        cancel,
    )
    .await
    .expect("loop");

    assert_eq!(outcome, LoopOutcome::Unlocked(String::from("root")));
}

#[tokio::test]
async fn without_a_superuser_the_occupant_keeps_the_prompt() {
    let (prompt, prompts) = ScriptedPrompt::new(&[b"a", b"b", b"c", b"d", b"open sesame"]);
    let verifier = MapVerifier::new(&[("case", b"open sesame")]);
    let (_tx, cancel) = live_cancel();

    let outcome = run_auth_loop(
        prompt,
        &verifier,
        identity("case"),
        None,
        &fast_settings(),
        cancel,
    )
    .await
    .expect("loop");

    assert_eq!(outcome, LoopOutcome::Unlocked(String::from("case")));
    let seen = prompts.lock().expect("prompt log").clone();
    assert_eq!(seen.len(), 5);
    assert!(seen.iter().all(|p| p == "case's password: "));
}

#[tokio::test]
async fn pre_set_cancellation_ends_the_loop_before_any_prompt() {
    let (prompt, prompts) = ScriptedPrompt::new(&[b"never read"]);
    let verifier = MapVerifier::new(&[("case", b"open sesame")]);
    let (_tx, cancel) = watch::channel(true);

    let outcome = run_auth_loop(
        prompt,
        &verifier,
        identity("case"),
        None,
        &fast_settings(),
        cancel,
    )
    .await
    .expect("loop");

    assert_eq!(outcome, LoopOutcome::Cancelled);
    assert!(prompts.lock().expect("prompt log").is_empty());
}

#[tokio::test]
async fn cancellation_during_the_cooldown_is_observed() {
    let (prompt, prompts) = ScriptedPrompt::new(&[b"wrong"]);
    let verifier = MapVerifier::new(&[("case", b"open sesame")]);
    let settings = Settings {
        cooldown_secs: 3600,
        occupant_tries: 3,
        ..Settings::default()
    };
    let (tx, cancel) = live_cancel();

    let driver = tokio::spawn(async move {
        run_auth_loop(prompt, &verifier, identity("case"), None, &settings, cancel).await
    });
    // Give the loop time to consume the scripted failure and enter the
    // cooldown, then cancel.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    tx.send(true).expect("cancel");

    let outcome = driver.await.expect("join").expect("loop");
    assert_eq!(outcome, LoopOutcome::Cancelled);
    assert_eq!(prompts.lock().expect("prompt log").len(), 1);
}

#[test]
fn cancellation_is_not_stalled_by_a_blocked_prompt_read() {
    /// A prompt whose read blocks far longer than the cancellation should
    /// take to be observed.
    struct SlowPrompt;
    impl PromptSource for SlowPrompt {
        fn read_password(&mut self, _prompt: &str) -> io::Result<Zeroizing<Vec<u8>>> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(Zeroizing::new(Vec::new()))
        }
        fn notify_failure(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn discard_pending(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let verifier = MapVerifier::new(&[("case", b"open sesame")]);
    let settings = fast_settings();
    let (tx, rx) = watch::channel(false);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        let _ = tx.send(true);
    });

    let start = Instant::now();
    let outcome = drive_auth_loop(
        SlowPrompt,
        &verifier,
        identity("case"),
        None,
        &settings,
        move || Ok(rx),
    )
    .expect("drive");

    assert_eq!(outcome, LoopOutcome::Cancelled);
    // The read is still parked in its worker; runtime teardown must not
    // wait the full 3 seconds for it.
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "teardown waited on the blocked read: {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn a_failing_prompt_read_is_fatal_not_retried() {
    struct BrokenPrompt;
    impl PromptSource for BrokenPrompt {
        fn read_password(&mut self, _prompt: &str) -> io::Result<Zeroizing<Vec<u8>>> {
            Err(io::Error::other("terminal gone"))
        }
        fn notify_failure(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn discard_pending(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let verifier = MapVerifier::new(&[("case", b"open sesame")]);
    let (_tx, cancel) = live_cancel();

    let result = run_auth_loop(
        BrokenPrompt,
        &verifier,
        identity("case"),
        None,
        &fast_settings(),
        cancel,
    )
    .await;
    assert!(result.is_err());
}
