use crate::can::{CanFrame, CAN_ID_BRAKE_TELEM, CAN_ID_WHEEL_SPEED_TELEM};
use crate::gate::PauseGate;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const AVG_WINDOW: usize = 4;

/// Handle to a continuously updated shared sensor scalar. The producer side
/// (board driver) and any number of consumers hold clones of the same cell.
#[derive(Debug, Clone, Default)]
pub struct SharedScalar(Arc<AtomicU32>);

impl SharedScalar {
    pub fn new(initial: u32) -> Self {
        Self(Arc::new(AtomicU32::new(initial)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u32) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// The live sensor set this controller snapshots for telemetry: front/rear
/// brake pressure (kPa), four wheel speeds (rpm), and the throttle position
/// consumed by the ETB collaborator.
#[derive(Debug, Clone, Default)]
pub struct SensorBank {
    brake_front_kpa: SharedScalar,
    brake_rear_kpa: SharedScalar,
    wheel_speed_rpm: [SharedScalar; 4],
    throttle_pos: SharedScalar,
}

impl SensorBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_brake_front(&self) -> SharedScalar {
        self.brake_front_kpa.clone()
    }

    pub fn subscribe_brake_rear(&self) -> SharedScalar {
        self.brake_rear_kpa.clone()
    }

    pub fn subscribe_wheel_speed(&self, wheel: usize) -> SharedScalar {
        self.wheel_speed_rpm[wheel % 4].clone()
    }

    pub fn subscribe_throttle(&self) -> SharedScalar {
        self.throttle_pos.clone()
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            brake_front_kpa: self.brake_front_kpa.get() as u16,
            brake_rear_kpa: self.brake_rear_kpa.get() as u16,
            wheel_speed_rpm: [
                self.wheel_speed_rpm[0].get() as u16,
                self.wheel_speed_rpm[1].get() as u16,
                self.wheel_speed_rpm[2].get() as u16,
                self.wheel_speed_rpm[3].get() as u16,
            ],
        }
    }
}

/// Point-in-time sensor values serialized onto the bus every broadcaster
/// cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub brake_front_kpa: u16,
    pub brake_rear_kpa: u16,
    pub wheel_speed_rpm: [u16; 4],
}

impl SensorSnapshot {
    pub fn brake_frame(&self) -> CanFrame {
        let f = self.brake_front_kpa.to_be_bytes();
        let r = self.brake_rear_kpa.to_be_bytes();
        CanFrame::standard(CAN_ID_BRAKE_TELEM, &[f[0], f[1], r[0], r[1]])
    }

    pub fn wheel_speed_frame(&self) -> CanFrame {
        let mut payload = [0u8; 8];
        for (chunk, speed) in payload.chunks_exact_mut(2).zip(self.wheel_speed_rpm) {
            chunk.copy_from_slice(&speed.to_be_bytes());
        }
        CanFrame::standard(CAN_ID_WHEEL_SPEED_TELEM, &payload)
    }
}

/// Rolling-average reader over one shared scalar, gated by a [`PauseGate`]
/// so a supervisor can pause consumption while the underlying sensor is
/// being re-ranged or its rail is suspect.
#[derive(Debug)]
pub struct AveragedReader {
    source: SharedScalar,
    gate: Arc<PauseGate>,
    window: Mutex<Deque<u32, AVG_WINDOW>>,
}

fn lock(m: &Mutex<Deque<u32, AVG_WINDOW>>) -> MutexGuard<'_, Deque<u32, AVG_WINDOW>> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AveragedReader {
    pub fn new(source: SharedScalar, gate: Arc<PauseGate>) -> Self {
        Self {
            source,
            gate,
            window: Mutex::new(Deque::new()),
        }
    }

    pub fn gate(&self) -> &Arc<PauseGate> {
        &self.gate
    }

    /// Samples the scalar and returns the mean of the last few samples.
    /// Blocks while the gate is paused.
    pub fn read_average(&self) -> u32 {
        self.gate.pass(|| {
            let mut window = lock(&self.window);
            if window.is_full() {
                window.pop_front();
            }
            // Push cannot fail after the pop above.
            let _ = window.push_back(self.source.get());
            let sum: u64 = window.iter().map(|&v| u64::from(v)).sum();
            (sum / window.len() as u64) as u32
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_frames_pack_big_endian() {
        let bank = SensorBank::new();
        bank.subscribe_brake_front().set(0x0102);
        bank.subscribe_brake_rear().set(0x0304);
        bank.subscribe_wheel_speed(2).set(0x0a0b);
        let snap = bank.snapshot();

        let brake = snap.brake_frame();
        assert_eq!(brake.dlc(), 4);
        assert_eq!(brake.payload(), &[0x01, 0x02, 0x03, 0x04]);
        assert!(!brake.extended);

        let wheels = snap.wheel_speed_frame();
        assert_eq!(wheels.dlc(), 8);
        assert_eq!(&wheels.payload()[4..6], &[0x0a, 0x0b]);
    }

    #[test]
    fn averaged_reader_smooths_window() {
        let source = SharedScalar::new(100);
        let reader = AveragedReader::new(source.clone(), Arc::new(PauseGate::new()));
        assert_eq!(reader.read_average(), 100);
        source.set(300);
        assert_eq!(reader.read_average(), 200);
    }
}
