// WhatsApp Connection Manager — Connection State Machine
// One ConnectionMachine per bot. Every input is tagged with the generation
// that produced it and goes through `apply`, the single transition function.
// Inputs from a superseded generation come back as `Outcome::Stale` and
// change nothing; that check is what keeps a late event from an old attempt
// from clobbering the attempt that replaced it.

use super::retry::RetryPlan;
use crate::atoms::types::{
    ClientProfile, ConnectionSnapshot, ConnectionStatus, ErrorRecord, QrData,
};
use ConnectionStatus::*;

#[derive(Debug, Clone)]
pub enum Input {
    /// A new attempt was registered. Carries the profile it opened with.
    Started { profile_index: usize, profile: ClientProfile },
    /// A pairing payload was rendered (possibly degraded to raw).
    QrReady { qr: QrData, degraded: Option<ErrorRecord> },
    /// Transport opened and the Persistence Writer succeeded.
    Connected,
    /// Transport opened but the Persistence Writer failed.
    PersistFailed(ErrorRecord),
    /// Transport closed; the plan is already decided.
    Closed { error: ErrorRecord, plan: RetryPlan },
    /// Working Area / transport open failed before registration.
    SetupFailed { error: ErrorRecord, plan: Option<RetryPlan> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Input belongs to an older generation; dropped.
    Stale,
    /// Input is not valid in the current status; dropped.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    bot_id: String,
    status: ConnectionStatus,
    qr: Option<QrData>,
    retry_count: u32,
    last_error: Option<ErrorRecord>,
    generation: u64,
    profile_index: usize,
    profile: ClientProfile,
    retry_scheduled: bool,
}

impl ConnectionMachine {
    pub fn new(bot_id: &str, generation: u64, profile: ClientProfile) -> Self {
        ConnectionMachine {
            bot_id: bot_id.into(),
            status: Initializing,
            qr: None,
            retry_count: 0,
            last_error: None,
            generation,
            profile_index: 0,
            profile,
            retry_scheduled: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn profile_index(&self) -> usize {
        self.profile_index
    }

    pub fn qr(&self) -> Option<&QrData> {
        self.qr.as_ref()
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    pub fn retry_scheduled(&self) -> bool {
        self.retry_scheduled
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            bot_id: self.bot_id.clone(),
            status: self.status,
            qr: self.qr.clone(),
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            generation: self.generation,
            profile: self.profile.clone(),
            retry_scheduled: self.retry_scheduled,
        }
    }

    /// The single transition function.
    pub fn apply(&mut self, generation: u64, input: Input) -> Outcome {
        match input {
            // New attempts must come from a strictly newer generation.
            Input::Started { profile_index, profile } => {
                if generation <= self.generation && self.generation != 0 {
                    return Outcome::Stale;
                }
                if self.status == Terminal {
                    return Outcome::Rejected;
                }
                self.generation = generation;
                self.status = Initializing;
                self.qr = None;
                self.profile_index = profile_index;
                self.profile = profile;
                self.retry_scheduled = false;
                Outcome::Applied
            }

            Input::SetupFailed { error, plan } => {
                if generation <= self.generation && self.generation != 0 {
                    return Outcome::Stale;
                }
                if self.status == Terminal {
                    return Outcome::Rejected;
                }
                self.generation = generation;
                self.qr = None;
                self.last_error = Some(error);
                self.settle_after_loss(plan);
                Outcome::Applied
            }

            other => {
                if generation != self.generation {
                    return Outcome::Stale;
                }
                self.apply_current(other)
            }
        }
    }

    fn apply_current(&mut self, input: Input) -> Outcome {
        match input {
            Input::QrReady { qr, degraded } => {
                if !matches!(self.status, Initializing | QrPending) {
                    return Outcome::Rejected;
                }
                self.status = QrPending;
                self.qr = Some(qr);
                if degraded.is_some() {
                    self.last_error = degraded;
                }
                Outcome::Applied
            }

            Input::Connected => {
                if !matches!(self.status, Initializing | QrPending) {
                    return Outcome::Rejected;
                }
                self.status = Connected;
                self.qr = None;
                self.retry_count = 0;
                self.last_error = None;
                self.retry_scheduled = false;
                Outcome::Applied
            }

            // Status stays where it was; only the error surfaces.
            Input::PersistFailed(error) => {
                if !matches!(self.status, Initializing | QrPending) {
                    return Outcome::Rejected;
                }
                self.last_error = Some(error);
                Outcome::Applied
            }

            Input::Closed { error, plan } => {
                if !matches!(self.status, Initializing | QrPending | Connected) {
                    return Outcome::Rejected;
                }
                self.qr = None;
                self.last_error = Some(error);
                self.settle_after_loss(Some(plan));
                Outcome::Applied
            }

            Input::Started { .. } | Input::SetupFailed { .. } => Outcome::Rejected,
        }
    }

    /// Disconnected with a retry pending, or Terminal when the plan gives up.
    /// `None` means no automatic follow-up: plain Disconnected.
    fn settle_after_loss(&mut self, plan: Option<RetryPlan>) {
        match plan {
            Some(RetryPlan::Retry { retry_count, .. }) => {
                self.status = Disconnected;
                self.retry_count = retry_count;
                self.retry_scheduled = true;
            }
            Some(RetryPlan::GiveUp) => {
                self.status = Terminal;
                self.retry_scheduled = false;
            }
            None => {
                self.status = Disconnected;
                self.retry_scheduled = false;
            }
        }
    }

    /// Called when a scheduled retry starts running (or is cancelled).
    pub fn clear_retry_scheduled(&mut self) {
        self.retry_scheduled = false;
    }
}
