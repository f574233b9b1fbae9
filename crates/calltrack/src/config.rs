use std::time::Duration;

use crate::entry::CallState;

/// Tracker configuration. Deserializable so a monitor can splice it out
/// of its own config file; every field has a default.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds added to a REGISTER expiration when computing the
    /// tracking timeout of a registration entry, so the binding outlives
    /// marginal refreshes.
    pub reg_delta: u32,
    /// Byte budget for entry buffers; `None` means unbounded. When the
    /// budget is exhausted, new dialogs are dropped (never existing
    /// state).
    pub mem_limit: Option<u64>,
    /// Per-state expiration timeouts.
    pub timeouts: StateTimeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reg_delta: 0,
            mem_limit: None,
            timeouts: StateTimeouts::default(),
        }
    }
}

/// How long an entry may sit in each dialog state before its timer
/// fires. The defaults fit interactive monitoring; a long-haul capture
/// replay will typically shrink them.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct StateTimeouts {
    #[serde(with = "humantime_serde")]
    pub none: Duration,
    #[serde(with = "humantime_serde")]
    pub init: Duration,
    #[serde(with = "humantime_serde")]
    pub first_invite: Duration,
    #[serde(with = "humantime_serde")]
    pub early_dialog: Duration,
    #[serde(with = "humantime_serde")]
    pub neg_reply: Duration,
    #[serde(with = "humantime_serde")]
    pub established: Duration,
    #[serde(with = "humantime_serde")]
    pub bye: Duration,
    #[serde(with = "humantime_serde")]
    pub bye_replied: Duration,
    #[serde(with = "humantime_serde")]
    pub canceled: Duration,
    #[serde(with = "humantime_serde")]
    pub first_non_invite: Duration,
    #[serde(with = "humantime_serde")]
    pub non_inv_neg_reply: Duration,
    #[serde(with = "humantime_serde")]
    pub non_inv_finished: Duration,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            none: Duration::from_secs(1),
            init: Duration::from_secs(1),
            first_invite: Duration::from_secs(120),
            early_dialog: Duration::from_secs(180),
            neg_reply: Duration::from_secs(30),
            established: Duration::from_secs(3600),
            bye: Duration::from_secs(30),
            bye_replied: Duration::from_secs(5),
            canceled: Duration::from_secs(5),
            first_non_invite: Duration::from_secs(30),
            non_inv_neg_reply: Duration::from_secs(5),
            non_inv_finished: Duration::from_secs(5),
        }
    }
}

impl StateTimeouts {
    pub fn for_state(&self, state: CallState) -> Duration {
        match state {
            CallState::None => self.none,
            CallState::Init => self.init,
            CallState::FirstInvite => self.first_invite,
            CallState::EarlyDialog => self.early_dialog,
            CallState::NegReply => self.neg_reply,
            CallState::Established => self.established,
            CallState::Bye => self.bye,
            CallState::ByeReplied => self.bye_replied,
            CallState::Canceled => self.canceled,
            CallState::FirstNonInvite => self.first_non_invite,
            CallState::NonInvNegReply => self.non_inv_neg_reply,
            CallState::NonInvFinished => self.non_inv_finished,
        }
    }

    /// Uniform timeout table, handy for tests and replay tools.
    pub fn uniform(d: Duration) -> Self {
        Self {
            none: d,
            init: d,
            first_invite: d,
            early_dialog: d,
            neg_reply: d,
            established: d,
            bye: d,
            bye_replied: d,
            canceled: d,
            first_non_invite: d,
            non_inv_neg_reply: d,
            non_inv_finished: d,
        }
    }
}
