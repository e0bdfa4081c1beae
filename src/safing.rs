use crate::board::SafingBoard;
use crate::fault::{codes, FaultCatalog};
use crate::flags::apply_flag_word;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Settle delay after powering the sense rail, before trusting sensor
/// readings.
pub const SENSOR_SETTLE: Duration = Duration::from_millis(50);
/// Settle delay after arming plausibility interrupts, long enough for the
/// open-line detection circuit to find a broken harness.
pub const OPEN_LINE_SETTLE: Duration = Duration::from_millis(100);
/// One-shot timer driving the rail-sense retry sub-machine.
pub const RAIL_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Arm protocol state. Transitions are strictly forward or to `ArmFailed`;
/// there is no path back to `Unarmed` within the task's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArmState {
    Unarmed,
    SensorSettle,
    RangeCheck,
    PlausibilityArm,
    HardArm,
    Armed,
    ArmFailed,
}

impl ArmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ArmState::Armed | ArmState::ArmFailed)
    }
}

/// Multi-step hardware-arming protocol. Runs once at startup; a failed arm
/// records its faults and leaves the rest of the process running so the
/// absence of an "armed" signal is observable on the bus.
///
/// The fault-flag subscription is taken at construction, before any arm
/// step; notification processing stays off until the sequencer reaches a
/// terminal state, so no notification can shorten a settle wait. Flags
/// raised mid-arm stay latched in the subscription word and are folded into
/// the catalog on abort, or picked up by the dispatch task afterwards.
pub struct SafingSequencer<B: SafingBoard> {
    board: Arc<B>,
    catalog: Arc<FaultCatalog>,
    subscription: watch::Receiver<u32>,
    state: ArmState,
}

impl<B: SafingBoard> SafingSequencer<B> {
    pub fn new(board: Arc<B>, catalog: Arc<FaultCatalog>) -> Self {
        let subscription = board.subscribe_fault_flags();
        Self {
            board,
            catalog,
            subscription,
            state: ArmState::Unarmed,
        }
    }

    pub fn state(&self) -> ArmState {
        self.state
    }

    /// Hands the subscription to the dispatch task once arming is done.
    pub fn into_subscription(self) -> watch::Receiver<u32> {
        self.subscription
    }

    /// Drives the arm protocol to a terminal state.
    pub async fn arm(&mut self) -> ArmState {
        debug_assert_eq!(self.state, ArmState::Unarmed, "sequencer is single-shot");

        if let Err(err) = self.board.enable_rail_sense() {
            warn!(%err, "rail sense enable failed");
            self.catalog.store_dtc(codes::RAIL_SENSE_STG);
            return self.abort();
        }

        self.state = ArmState::SensorSettle;
        tokio::time::sleep(SENSOR_SETTLE).await;

        self.state = ArmState::RangeCheck;
        if self.check_sensor_ranges().is_err() {
            warn!("software range/correlation check failed");
            return self.abort();
        }

        self.state = ArmState::PlausibilityArm;
        if let Err(err) = self.board.arm_plausibility_interrupts() {
            warn!(%err, "plausibility interrupt arm failed");
            return self.abort();
        }
        tokio::time::sleep(OPEN_LINE_SETTLE).await;

        self.state = ArmState::HardArm;
        if let Err(err) = self.board.arm_safing() {
            warn!(%err, "hardware safing arm failed");
            return self.abort();
        }

        self.state = ArmState::Armed;
        info!("safing interlock armed");
        self.state
    }

    /// Software range and correlation plausibility across the redundant
    /// sensor channels. Extension point: currently always passes, the
    /// hardware comparators cover the same conditions.
    fn check_sensor_ranges(&self) -> Result<(), ()> {
        let _ = self.board.sensors();
        Ok(())
    }

    fn abort(&mut self) -> ArmState {
        // Fold in any flags the board latched while we were arming, then
        // record the distinguished arm failure.
        apply_flag_word(&self.catalog, *self.subscription.borrow());
        self.catalog.store_dtc(codes::INITIAL_ARM_FAILED);
        self.state = ArmState::ArmFailed;
        warn!("initial arm failed; continuing unarmed");
        self.state
    }
}

/// Rail-sense retry sub-machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrySubstate {
    Idle,
    Waiting,
    Retrying,
}

/// Handle used by the dispatch task to arm the retry sub-machine. The
/// trigger channel holds one pending trigger at most, so a burst of
/// notifications for the same glitch collapses into a single retry.
#[derive(Debug, Clone)]
pub struct RetryTrigger(mpsc::Sender<()>);

impl RetryTrigger {
    pub fn trigger(&self) {
        let _ = self.0.try_send(());
    }
}

/// One-shot retry of the reference-rail sense line: `Idle → Waiting` (timer
/// armed) `→ Retrying` (hardware retry issued, timer re-armed) `→ Idle`
/// (outcome checked). Exactly one retry per glitch occurrence; a persistent
/// failure escalates to a stored DTC, a transient one clears silently.
pub struct RailSenseRetry<B: SafingBoard> {
    board: Arc<B>,
    catalog: Arc<FaultCatalog>,
    state: Mutex<RetrySubstate>,
    trigger_rx: mpsc::Receiver<()>,
}

fn lock(m: &Mutex<RetrySubstate>) -> MutexGuard<'_, RetrySubstate> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: SafingBoard> RailSenseRetry<B> {
    pub fn new(board: Arc<B>, catalog: Arc<FaultCatalog>) -> (Self, RetryTrigger) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        (
            Self {
                board,
                catalog,
                state: Mutex::new(RetrySubstate::Idle),
                trigger_rx,
            },
            RetryTrigger(trigger_tx),
        )
    }

    pub fn state(&self) -> RetrySubstate {
        *lock(&self.state)
    }

    /// `Idle → Waiting`. Returns false when a retry is already in flight.
    pub fn begin(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != RetrySubstate::Idle {
            return false;
        }
        *state = RetrySubstate::Waiting;
        true
    }

    /// `Waiting → Retrying`: issue the hardware retry. An immediately
    /// rejected retry is left for `conclude` to observe as a bad rail.
    pub fn issue(&self) {
        *lock(&self.state) = RetrySubstate::Retrying;
        if let Err(err) = self.board.retry_rail_sense() {
            warn!(%err, "rail sense retry rejected");
        }
    }

    /// `Retrying → Idle`: check the outcome. Failure escalates; success
    /// clears silently.
    pub fn conclude(&self) {
        *lock(&self.state) = RetrySubstate::Idle;
        if self.board.rail_sense_ok() {
            debug!("rail sense recovered after retry");
        } else {
            warn!("rail sense still failing after retry");
            self.catalog.store_dtc(codes::RAIL_SENSE_STG);
        }
    }

    /// Task loop: each trigger drives one full retry cycle.
    pub async fn run(mut self) {
        while self.trigger_rx.recv().await.is_some() {
            if !self.begin() {
                continue;
            }
            tokio::time::sleep(RAIL_RETRY_DELAY).await;
            self.issue();
            tokio::time::sleep(RAIL_RETRY_DELAY).await;
            self.conclude();
        }
    }
}
