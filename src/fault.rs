use crate::can::CanFrame;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::warn;

pub const DTC_TABLE_SLOTS: usize = 16;
pub const FAULT_TABLE_SLOTS: usize = 16;

const DTC_CATEGORY_MASK: u16 = 0xc000;
const DTC_NUMBER_MASK: u16 = 0x3fff;

/// Diagnostic Trouble Code: a 2-bit category plus a 14-bit number, packed
/// into 16 bits the way they appear on the bus.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dtc(u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl Dtc {
    pub const fn powertrain(n: u16) -> Self {
        Self(n & DTC_NUMBER_MASK)
    }

    pub const fn chassis(n: u16) -> Self {
        Self(0x4000 | (n & DTC_NUMBER_MASK))
    }

    pub const fn body(n: u16) -> Self {
        Self(0x8000 | (n & DTC_NUMBER_MASK))
    }

    pub const fn network(n: u16) -> Self {
        Self(0xc000 | (n & DTC_NUMBER_MASK))
    }

    pub const fn category(self) -> DtcCategory {
        match self.0 & DTC_CATEGORY_MASK {
            0x0000 => DtcCategory::Powertrain,
            0x4000 => DtcCategory::Chassis,
            0x8000 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub const fn number(self) -> u16 {
        self.0 & DTC_NUMBER_MASK
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl core::fmt::Display for Dtc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let letter = match self.category() {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        };
        write!(f, "{}{:04}", letter, self.number())
    }
}

impl core::fmt::Debug for Dtc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Dtc({})", self)
    }
}

/// Vehicle-domain trouble codes reported by this controller.
///
/// APPS = accelerator pedal position sensor, TPS = throttle position sensor,
/// BRKF/BRKR = front/rear brake pressure, BSPD = brake system plausibility
/// device. STP/STG = short to power/ground, OOC = out of correlation.
pub mod codes {
    use super::Dtc;

    pub const RAIL_SENSE_STG: Dtc = Dtc::powertrain(1);
    pub const APPS1_STP: Dtc = Dtc::powertrain(2);
    pub const APPS2_STP: Dtc = Dtc::powertrain(3);
    pub const BRKF_STP: Dtc = Dtc::powertrain(4);
    pub const BRKR_STP: Dtc = Dtc::powertrain(5);
    pub const TPS_STP: Dtc = Dtc::powertrain(6);
    pub const APPS1_LOW: Dtc = Dtc::powertrain(7);
    pub const APPS1_HIGH: Dtc = Dtc::powertrain(8);
    pub const APPS2_LOW: Dtc = Dtc::powertrain(9);
    pub const APPS2_HIGH: Dtc = Dtc::powertrain(10);
    pub const BRKF_LOW: Dtc = Dtc::powertrain(11);
    pub const BRKF_HIGH: Dtc = Dtc::powertrain(12);
    pub const BRKR_LOW: Dtc = Dtc::powertrain(13);
    pub const BRKR_HIGH: Dtc = Dtc::powertrain(14);
    pub const TPS1_LOW: Dtc = Dtc::powertrain(15);
    pub const TPS1_HIGH: Dtc = Dtc::powertrain(16);
    pub const TPS2_LOW: Dtc = Dtc::powertrain(17);
    pub const TPS2_HIGH: Dtc = Dtc::powertrain(18);
    pub const APPS_OOC: Dtc = Dtc::powertrain(19);
    pub const TPS_OOC: Dtc = Dtc::powertrain(20);
    pub const APPS_HARD_OOC: Dtc = Dtc::powertrain(21);
    pub const TPS_HARD_OOC: Dtc = Dtc::powertrain(22);
    pub const APPS1_OPEN: Dtc = Dtc::powertrain(23);
    pub const APPS2_OPEN: Dtc = Dtc::powertrain(24);
    pub const BRKF_OPEN: Dtc = Dtc::powertrain(25);
    pub const BRKR_OPEN: Dtc = Dtc::powertrain(26);
    pub const TPS1_OPEN: Dtc = Dtc::powertrain(27);
    pub const TPS2_OPEN: Dtc = Dtc::powertrain(28);
    pub const LOCAL_BSPD: Dtc = Dtc::powertrain(29);
    pub const BSPD_OPEN: Dtc = Dtc::powertrain(30);
    pub const BSPD_REARMED: Dtc = Dtc::powertrain(31);
    pub const INITIAL_ARM_FAILED: Dtc = Dtc::powertrain(32);
    pub const AUX_RAIL_STP: Dtc = Dtc::powertrain(33);

    /// Generic "an internal fault occurred" code, raised alongside every
    /// internal-fault store so bus listeners never need the internal taxonomy.
    pub const INTERNAL_FAULT: Dtc = Dtc::network(3000);
}

/// Software/control faults internal to this program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum InternalFault {
    CanOpenFailed = 1,
    DrsSoftware = 2,
    UnexpectedDisarm1 = 3,
    UnexpectedSafing1 = 4,
    UnexpectedDisarm2 = 5,
    UnexpectedSafing2 = 6,
    OpenLineInternal = 7,
    AlreadyArmed1 = 8,
    AlreadyArmed2 = 9,
    NotSafing1 = 10,
    NotSafing2 = 11,
    ArmFailed1 = 12,
    ArmFailed2 = 13,
    DtcTableOverflow = 14,
}

impl InternalFault {
    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// One live fault. Identity is the code: a table never holds two records
/// with the same code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub code: u16,
    pub first_seen_ms: u32,
    pub keycycle: u8,
}

/// Selects the on-bus fault payload layout. The two encodings disagree on
/// timestamp width; both are kept rather than guessing which is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultWireVersion {
    /// Legacy 7-byte payload, 24-bit timestamp (top byte truncated).
    V1,
    /// Current 8-byte payload, full 32-bit timestamp.
    V2,
}

impl FaultRecord {
    /// Serializes this record into a CAN frame with the given identifier.
    pub fn to_frame(&self, id: u32, version: FaultWireVersion) -> CanFrame {
        let code = self.code.to_be_bytes();
        let t = self.first_seen_ms;
        let payload: &[u8] = match version {
            FaultWireVersion::V2 => &[
                code[0],
                code[1],
                self.keycycle,
                (t >> 24) as u8,
                (t >> 16) as u8,
                (t >> 8) as u8,
                t as u8,
                0,
            ],
            FaultWireVersion::V1 => &[
                code[0],
                code[1],
                self.keycycle,
                (t >> 16) as u8,
                (t >> 8) as u8,
                t as u8,
                0,
            ],
        };
        CanFrame::extended(id, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreOutcome {
    Stored,
    Duplicate,
    Full,
}

#[derive(Debug)]
struct FaultTable {
    slots: [Option<FaultRecord>; DTC_TABLE_SLOTS],
}

impl FaultTable {
    const fn new() -> Self {
        Self {
            slots: [None; DTC_TABLE_SLOTS],
        }
    }

    /// First-fit, idempotent, append-only store.
    fn store(&mut self, record: FaultRecord) -> StoreOutcome {
        if self.slots.iter().flatten().any(|r| r.code == record.code) {
            return StoreOutcome::Duplicate;
        }
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(record);
                StoreOutcome::Stored
            }
            None => StoreOutcome::Full,
        }
    }
}

/// Bounded, deduplicating record store for DTCs and internal faults.
///
/// Mutators may be called from ordinary task flow and from the asynchronous
/// fault-dispatch task; each store or slot read is a single short critical
/// section, so a concurrent broadcaster never observes a half-written slot.
#[derive(Debug)]
pub struct FaultCatalog {
    dtcs: Mutex<FaultTable>,
    faults: Mutex<FaultTable>,
    dtc_overflows: AtomicU32,
    fault_overflows: AtomicU32,
    keycycle: u8,
    epoch: Instant,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FaultCatalog {
    pub fn new(keycycle: u8) -> Self {
        Self {
            dtcs: Mutex::new(FaultTable::new()),
            faults: Mutex::new(FaultTable::new()),
            dtc_overflows: AtomicU32::new(0),
            fault_overflows: AtomicU32::new(0),
            keycycle,
            epoch: Instant::now(),
        }
    }

    pub fn keycycle(&self) -> u8 {
        self.keycycle
    }

    fn record(&self, code: u16) -> FaultRecord {
        FaultRecord {
            code,
            first_seen_ms: self.epoch.elapsed().as_millis() as u32,
            keycycle: self.keycycle,
        }
    }

    /// Records a DTC. Duplicate codes are a no-op; a full table drops the
    /// new code and raises a `DtcTableOverflow` internal fault instead.
    pub fn store_dtc(&self, dtc: Dtc) {
        if lock(&self.dtcs).store(self.record(dtc.raw())) == StoreOutcome::Full {
            self.dtc_overflows.fetch_add(1, Ordering::Relaxed);
            warn!(code = %dtc, "DTC table full, dropping fault");
            // Best effort: the internal table may still have room for the
            // meta-fault even though the DTC table does not.
            self.store_internal_raw(InternalFault::DtcTableOverflow);
        }
    }

    /// Records an internal fault and always also records the generic
    /// `INTERNAL_FAULT` DTC.
    pub fn store_internal_fault(&self, fault: InternalFault) {
        self.store_internal_raw(fault);
        self.store_dtc(codes::INTERNAL_FAULT);
    }

    fn store_internal_raw(&self, fault: InternalFault) {
        if lock(&self.faults).store(self.record(fault.code())) == StoreOutcome::Full {
            self.fault_overflows.fetch_add(1, Ordering::Relaxed);
            warn!(code = fault.code(), "internal fault table full, dropping fault");
        }
    }

    /// Snapshot of one DTC slot, for the broadcaster's round-robin sweep.
    pub fn dtc_slot(&self, index: usize) -> Option<FaultRecord> {
        lock(&self.dtcs).slots.get(index).copied().flatten()
    }

    /// Snapshot of one internal-fault slot.
    pub fn fault_slot(&self, index: usize) -> Option<FaultRecord> {
        lock(&self.faults).slots.get(index).copied().flatten()
    }

    pub fn dtc_overflows(&self) -> u32 {
        self.dtc_overflows.load(Ordering::Relaxed)
    }

    pub fn fault_overflows(&self) -> u32 {
        self.fault_overflows.load(Ordering::Relaxed)
    }

    pub fn live_dtc_count(&self) -> usize {
        lock(&self.dtcs).slots.iter().flatten().count()
    }

    pub fn live_fault_count(&self) -> usize {
        lock(&self.faults).slots.iter().flatten().count()
    }

    pub fn has_dtc(&self, dtc: Dtc) -> bool {
        lock(&self.dtcs)
            .slots
            .iter()
            .flatten()
            .any(|r| r.code == dtc.raw())
    }

    pub fn has_internal_fault(&self, fault: InternalFault) -> bool {
        lock(&self.faults)
            .slots
            .iter()
            .flatten()
            .any(|r| r.code == fault.code())
    }

    /// Full-table snapshot for status reporting; the broadcaster itself only
    /// ever reads one slot per cycle.
    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            dtcs: lock(&self.dtcs).slots.iter().flatten().copied().collect(),
            faults: lock(&self.faults).slots.iter().flatten().copied().collect(),
            dtc_overflows: self.dtc_overflows(),
            fault_overflows: self.fault_overflows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub dtcs: Vec<FaultRecord>,
    pub faults: Vec<FaultRecord>,
    pub dtc_overflows: u32,
    pub fault_overflows: u32,
}
