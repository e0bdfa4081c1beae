use crate::sensors::SensorBank;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BoardError {
    #[error("reference rail sense enable rejected")]
    RailSenseEnable,
    #[error("hardware plausibility interrupt arm rejected")]
    PlausibilityArm,
    #[error("hardware safing arm rejected (not disarmed with safing asserted)")]
    SafingArm,
    #[error("rail sense retry rejected")]
    RailRetry,
}

/// Board-support surface the safing core drives. Real hardware hides behind
/// ioctl-style calls; [`SimBoard`] stands in for it everywhere in this crate.
///
/// All operations are short and non-blocking; settle time is the caller's
/// responsibility.
pub trait SafingBoard: Send + Sync + 'static {
    /// Live aggregated fault-flag word. The receiver always observes the
    /// latest latched word; a change is the asynchronous notification.
    fn subscribe_fault_flags(&self) -> watch::Receiver<u32>;

    /// Powers the reference-voltage sense line and enables its fail signal.
    fn enable_rail_sense(&self) -> Result<(), BoardError>;

    /// Arms edge interrupts for hardware out-of-range, open-line, and
    /// out-of-correlation faults.
    fn arm_plausibility_interrupts(&self) -> Result<(), BoardError>;

    /// Final arm: requires the interlock disarmed with safing asserted,
    /// issues the arming signal, and verifies the armed/not-safing outcome.
    fn arm_safing(&self) -> Result<(), BoardError>;

    /// Issues one hardware retry of the reference-rail sense line.
    fn retry_rail_sense(&self) -> Result<(), BoardError>;

    /// Whether the reference rail currently reads good.
    fn rail_sense_ok(&self) -> bool;

    fn sensors(&self) -> &SensorBank;
}

/// Which board operations the simulation should reject. Failure injection
/// happens at the board boundary so the core sees the same error surface as
/// on hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimFailures {
    pub rail_sense_enable: bool,
    pub plausibility_arm: bool,
    pub safing_arm: bool,
    pub rail_retry: bool,
}

/// Simulated safing board: latches fault flags into a watch word the way the
/// board driver latches them into the subscription, and lets tests and the
/// simulator binary reject individual arm steps.
#[derive(Debug)]
pub struct SimBoard {
    flags_tx: watch::Sender<u32>,
    sensors: SensorBank,
    failures: Mutex<SimFailures>,
    rail_ok: Mutex<bool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimBoard {
    pub fn new() -> Self {
        Self {
            flags_tx: watch::channel(0).0,
            sensors: SensorBank::new(),
            failures: Mutex::new(SimFailures::default()),
            rail_ok: Mutex::new(true),
        }
    }

    pub fn with_failures(failures: SimFailures) -> Self {
        let board = Self::new();
        *lock(&board.failures) = failures;
        board
    }

    pub fn set_failures(&self, failures: SimFailures) {
        *lock(&self.failures) = failures;
    }

    /// Latches flag bits into the live word and fires the notification.
    pub fn raise_flags(&self, flag_bits: u32) {
        self.flags_tx.send_modify(|word| *word |= flag_bits);
    }

    /// Clears latched bits, as the board driver does once a condition ends.
    pub fn clear_flags(&self, flag_bits: u32) {
        self.flags_tx.send_modify(|word| *word &= !flag_bits);
    }

    pub fn current_flags(&self) -> u32 {
        *self.flags_tx.borrow()
    }

    /// Marks the reference rail bad; a successful retry restores it unless
    /// `rail_retry` failure injection is on.
    pub fn glitch_rail(&self) {
        *lock(&self.rail_ok) = false;
        self.raise_flags(crate::flags::bits::RAIL_SENSE_STG);
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SafingBoard for SimBoard {
    fn subscribe_fault_flags(&self) -> watch::Receiver<u32> {
        self.flags_tx.subscribe()
    }

    fn enable_rail_sense(&self) -> Result<(), BoardError> {
        if lock(&self.failures).rail_sense_enable {
            return Err(BoardError::RailSenseEnable);
        }
        Ok(())
    }

    fn arm_plausibility_interrupts(&self) -> Result<(), BoardError> {
        if lock(&self.failures).plausibility_arm {
            return Err(BoardError::PlausibilityArm);
        }
        Ok(())
    }

    fn arm_safing(&self) -> Result<(), BoardError> {
        if lock(&self.failures).safing_arm {
            return Err(BoardError::SafingArm);
        }
        Ok(())
    }

    fn retry_rail_sense(&self) -> Result<(), BoardError> {
        if lock(&self.failures).rail_retry {
            return Err(BoardError::RailRetry);
        }
        *lock(&self.rail_ok) = true;
        self.clear_flags(crate::flags::bits::RAIL_SENSE_STG);
        Ok(())
    }

    fn rail_sense_ok(&self) -> bool {
        *lock(&self.rail_ok)
    }

    fn sensors(&self) -> &SensorBank {
        &self.sensors
    }
}
