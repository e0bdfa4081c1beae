use crate::fault::{codes, Dtc, FaultCatalog, InternalFault};
use crate::safing::RetryTrigger;
use tokio::sync::watch;
use tracing::debug;

/// Aggregated fault-flag word raised by the board. Each bit is latched by
/// the board driver until the flag condition clears; the word travels as the
/// live payload of the asynchronous fault notification.
pub mod bits {
    pub const RAIL_SENSE_STG: u32 = 1 << 0;
    pub const STP_APPS1: u32 = 1 << 1;
    pub const STP_APPS2: u32 = 1 << 2;
    pub const STP_BRKF: u32 = 1 << 3;
    pub const STP_BRKR: u32 = 1 << 4;
    pub const STP_TPS: u32 = 1 << 5;
    pub const STP_AUX: u32 = 1 << 6;
    pub const OL_APPS1: u32 = 1 << 7;
    pub const OL_APPS2: u32 = 1 << 8;
    pub const OL_BRKF: u32 = 1 << 9;
    pub const OL_BRKR: u32 = 1 << 10;
    pub const OL_TPS1: u32 = 1 << 11;
    pub const OL_TPS2: u32 = 1 << 12;
    pub const OOC_TPS: u32 = 1 << 13;
    pub const OOC_APPS: u32 = 1 << 14;
    pub const SAFING1_DISARMING: u32 = 1 << 15;
    pub const SAFING1_ASSERTING: u32 = 1 << 16;
    pub const SAFING2_DISARMING: u32 = 1 << 17;
    pub const SAFING2_ASSERTING: u32 = 1 << 18;
    pub const OL_INTERNAL_FAULT: u32 = 1 << 19;
    pub const SAFING1_ALREADY_ARMED: u32 = 1 << 20;
    pub const SAFING2_ALREADY_ARMED: u32 = 1 << 21;
    pub const SAFING1_NOT_ASSERTED: u32 = 1 << 22;
    pub const SAFING2_NOT_ASSERTED: u32 = 1 << 23;
    pub const SAFING1_ARM_FAILED: u32 = 1 << 24;
    pub const SAFING2_ARM_FAILED: u32 = 1 << 25;
}

/// Where a flag bit lands in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSink {
    Dtc(Dtc),
    Internal(InternalFault),
}

/// Total, order-independent mapping from flag bits to stored codes. Bits
/// not listed here are ignored by design.
pub const FLAG_DISPATCH: &[(u32, FaultSink)] = &[
    (bits::RAIL_SENSE_STG, FaultSink::Dtc(codes::RAIL_SENSE_STG)),
    (bits::STP_APPS1, FaultSink::Dtc(codes::APPS1_STP)),
    (bits::STP_APPS2, FaultSink::Dtc(codes::APPS2_STP)),
    (bits::STP_BRKF, FaultSink::Dtc(codes::BRKF_STP)),
    (bits::STP_BRKR, FaultSink::Dtc(codes::BRKR_STP)),
    (bits::STP_TPS, FaultSink::Dtc(codes::TPS_STP)),
    (bits::STP_AUX, FaultSink::Dtc(codes::AUX_RAIL_STP)),
    (bits::OL_APPS1, FaultSink::Dtc(codes::APPS1_OPEN)),
    (bits::OL_APPS2, FaultSink::Dtc(codes::APPS2_OPEN)),
    (bits::OL_BRKF, FaultSink::Dtc(codes::BRKF_OPEN)),
    (bits::OL_BRKR, FaultSink::Dtc(codes::BRKR_OPEN)),
    (bits::OL_TPS1, FaultSink::Dtc(codes::TPS1_OPEN)),
    (bits::OL_TPS2, FaultSink::Dtc(codes::TPS2_OPEN)),
    (bits::OOC_TPS, FaultSink::Dtc(codes::TPS_OOC)),
    (bits::OOC_APPS, FaultSink::Dtc(codes::APPS_OOC)),
    (
        bits::SAFING1_DISARMING,
        FaultSink::Internal(InternalFault::UnexpectedDisarm1),
    ),
    (
        bits::SAFING1_ASSERTING,
        FaultSink::Internal(InternalFault::UnexpectedSafing1),
    ),
    (
        bits::SAFING2_DISARMING,
        FaultSink::Internal(InternalFault::UnexpectedDisarm2),
    ),
    (
        bits::SAFING2_ASSERTING,
        FaultSink::Internal(InternalFault::UnexpectedSafing2),
    ),
    (
        bits::OL_INTERNAL_FAULT,
        FaultSink::Internal(InternalFault::OpenLineInternal),
    ),
    (
        bits::SAFING1_ALREADY_ARMED,
        FaultSink::Internal(InternalFault::AlreadyArmed1),
    ),
    (
        bits::SAFING2_ALREADY_ARMED,
        FaultSink::Internal(InternalFault::AlreadyArmed2),
    ),
    (
        bits::SAFING1_NOT_ASSERTED,
        FaultSink::Internal(InternalFault::NotSafing1),
    ),
    (
        bits::SAFING2_NOT_ASSERTED,
        FaultSink::Internal(InternalFault::NotSafing2),
    ),
    (
        bits::SAFING1_ARM_FAILED,
        FaultSink::Internal(InternalFault::ArmFailed1),
    ),
    (
        bits::SAFING2_ARM_FAILED,
        FaultSink::Internal(InternalFault::ArmFailed2),
    ),
];

/// Maps every set, recognized bit of `word` onto a catalog store.
/// Unrecognized bits are ignored. Idempotent because the catalog dedupes.
pub fn apply_flag_word(catalog: &FaultCatalog, word: u32) {
    for &(bit, sink) in FLAG_DISPATCH {
        if word & bit != 0 {
            match sink {
                FaultSink::Dtc(dtc) => catalog.store_dtc(dtc),
                FaultSink::Internal(fault) => catalog.store_internal_fault(fault),
            }
        }
    }
}

pub fn rail_sense_flagged(word: u32) -> bool {
    word & bits::RAIL_SENSE_STG != 0
}

/// Asynchronous fault dispatch task: every change of the flag word is folded
/// into the catalog, and a flagged reference rail additionally arms the
/// rail-sense retry sub-machine. Runs until the board side drops.
pub async fn run_dispatch(
    mut subscription: watch::Receiver<u32>,
    catalog: std::sync::Arc<FaultCatalog>,
    retry: RetryTrigger,
) {
    // Fold in whatever is latched right now; flags raised before this task
    // started must not be lost.
    let mut word = *subscription.borrow_and_update();
    loop {
        if word != 0 {
            debug!(word = %format_args!("{word:#010x}"), "fault flags dispatched");
            apply_flag_word(&catalog, word);
            if rail_sense_flagged(word) {
                retry.trigger();
            }
        }
        if subscription.changed().await.is_err() {
            return;
        }
        word = *subscription.borrow_and_update();
    }
}
