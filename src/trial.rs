//! Retry and identity-switch state machine.
//!
//! Pure values and a pure transition function: the auth loop feeds every
//! failed attempt through [`TrialState::after_failure`] and prompts as
//! whichever identity comes back active. No terminal I/O lives here, so
//! the whole policy is testable in isolation.
//!
//! Net effect of the policy: the occupant gets a fixed number of tries
//! before the superuser override is offered; once offered, a single
//! superuser failure bounces control back to the occupant rather than
//! granting further superuser tries.

/// Which identity the loop is currently prompting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveIdentity {
    /// The console's current occupant.
    Occupant,
    /// The superuser escape path.
    Superuser,
}

/// State carried across authentication attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialState {
    /// The identity the next attempt is verified against.
    pub active: ActiveIdentity,
    /// Consecutive failures under the active identity.
    pub failures: u32,
    /// Whether a viable superuser escape path exists at all.
    pub dual: bool,
    /// Occupant failures before the superuser path is offered.
    pub switch_after: u32,
}

impl TrialState {
    /// Fresh state: prompting as the occupant with no failures recorded.
    #[must_use]
    pub fn new(dual: bool, switch_after: u32) -> Self {
        Self {
            active: ActiveIdentity::Occupant,
            failures: 0,
            dual,
            switch_after,
        }
    }

    /// The state after one failed attempt under the active identity.
    ///
    /// Without a superuser path the occupant just keeps trying. With one,
    /// the occupant is switched out after `switch_after` consecutive
    /// failures, and any superuser failure immediately reverts to the
    /// occupant with the counter reset.
    #[must_use]
    pub fn after_failure(self) -> Self {
        if !self.dual {
            return Self {
                failures: self.failures.saturating_add(1),
                ..self
            };
        }
        match self.active {
            ActiveIdentity::Superuser => Self {
                active: ActiveIdentity::Occupant,
                failures: 0,
                ..self
            },
            ActiveIdentity::Occupant => {
                let failures = self.failures.saturating_add(1);
                if failures >= self.switch_after {
                    Self {
                        active: ActiveIdentity::Superuser,
                        failures: 0,
                        ..self
                    }
                } else {
                    Self { failures, ..self }
                }
            }
        }
    }
}
