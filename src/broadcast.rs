use crate::can::{CAN_ID_DTC_TX, CAN_ID_FAULT_TX};
use crate::fault::{FaultCatalog, FaultWireVersion, DTC_TABLE_SLOTS, FAULT_TABLE_SLOTS};
use crate::queue::TopicQueue;
use crate::sensors::SensorBank;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Broadcast cadence. One slot per fault table per cycle, so a full sweep of
/// each 16-slot table takes 800ms.
pub const BROADCAST_PERIOD: Duration = Duration::from_millis(50);

/// Periodic bus reporter: round-robins over both fault tables and publishes
/// brake and wheel-speed telemetry every cycle, all onto `safing.tx`.
pub struct Broadcaster {
    catalog: Arc<FaultCatalog>,
    sensors: SensorBank,
    tx: Arc<TopicQueue>,
    wire_version: FaultWireVersion,
    dtc_cursor: usize,
    fault_cursor: usize,
}

impl Broadcaster {
    pub fn new(
        catalog: Arc<FaultCatalog>,
        sensors: SensorBank,
        tx: Arc<TopicQueue>,
        wire_version: FaultWireVersion,
    ) -> Self {
        Self {
            catalog,
            sensors,
            tx,
            wire_version,
            dtc_cursor: 0,
            fault_cursor: 0,
        }
    }

    pub fn dtc_cursor(&self) -> usize {
        self.dtc_cursor
    }

    pub fn fault_cursor(&self) -> usize {
        self.fault_cursor
    }

    fn enqueue(&self, frame: crate::can::CanFrame) -> usize {
        match self.tx.send(frame) {
            Ok(()) => 1,
            Err(err) => {
                warn!(%err, id = frame.id, "broadcast frame dropped");
                0
            }
        }
    }

    /// One broadcast cycle. Returns how many frames were actually enqueued.
    /// Cursors advance over empty slots too, so a sparse table still sweeps
    /// in a bounded number of cycles.
    ///
    /// Fault frames enqueue before the telemetry pair. When both tables hit
    /// an occupied slot the cycle offers four frames to a three-deep queue,
    /// so it is the wheel-speed frame that gets shed, never a fault record;
    /// every occupied slot still reaches the wire within one full sweep.
    pub fn cycle(&mut self) -> usize {
        let mut sent = 0;

        if let Some(record) = self.catalog.fault_slot(self.fault_cursor) {
            sent += self.enqueue(record.to_frame(CAN_ID_FAULT_TX, self.wire_version));
        }
        self.fault_cursor = (self.fault_cursor + 1) % FAULT_TABLE_SLOTS;

        if let Some(record) = self.catalog.dtc_slot(self.dtc_cursor) {
            sent += self.enqueue(record.to_frame(CAN_ID_DTC_TX, self.wire_version));
        }
        self.dtc_cursor = (self.dtc_cursor + 1) % DTC_TABLE_SLOTS;

        let snapshot = self.sensors.snapshot();
        sent += self.enqueue(snapshot.brake_frame());
        sent += self.enqueue(snapshot.wheel_speed_frame());

        sent
    }

    /// Task loop driving `cycle` at the broadcast period.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(BROADCAST_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sent = self.cycle();
            debug!(frames = sent, "broadcast cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::codes;
    use crate::queue::TOPIC_SAFING_TX;

    fn fixture() -> (Arc<FaultCatalog>, Arc<TopicQueue>, Broadcaster) {
        let catalog = Arc::new(FaultCatalog::new(3));
        let tx = Arc::new(TopicQueue::new(TOPIC_SAFING_TX));
        let broadcaster = Broadcaster::new(
            Arc::clone(&catalog),
            SensorBank::new(),
            Arc::clone(&tx),
            FaultWireVersion::V2,
        );
        (catalog, tx, broadcaster)
    }

    #[test]
    fn empty_tables_still_publish_telemetry() {
        let (_catalog, tx, mut broadcaster) = fixture();
        assert_eq!(broadcaster.cycle(), 2);
        let brake = tx.try_recv().unwrap();
        let wheels = tx.try_recv().unwrap();
        assert_eq!(brake.id, crate::can::CAN_ID_BRAKE_TELEM);
        assert_eq!(wheels.id, crate::can::CAN_ID_WHEEL_SPEED_TELEM);
    }

    #[test]
    fn cursors_wrap_after_full_sweep() {
        let (catalog, tx, mut broadcaster) = fixture();
        catalog.store_dtc(codes::RAIL_SENSE_STG);
        for _ in 0..DTC_TABLE_SLOTS {
            broadcaster.cycle();
            while tx.try_recv().is_some() {}
        }
        assert_eq!(broadcaster.dtc_cursor(), 0);
        assert_eq!(broadcaster.fault_cursor(), 0);
    }

    #[test]
    fn fault_frames_outrank_telemetry_on_a_full_queue() {
        let (catalog, tx, mut broadcaster) = fixture();
        catalog.store_internal_fault(crate::fault::InternalFault::DrsSoftware);
        // Occupied slots in both tables: four candidate frames, three slots.
        assert_eq!(broadcaster.cycle(), 3);

        let first = tx.try_recv().unwrap();
        let second = tx.try_recv().unwrap();
        let third = tx.try_recv().unwrap();
        assert!(tx.try_recv().is_none());
        assert_eq!(first.id, crate::can::CAN_ID_FAULT_TX);
        assert_eq!(second.id, CAN_ID_DTC_TX);
        // Only the trailing wheel-speed frame was shed.
        assert_eq!(third.id, crate::can::CAN_ID_BRAKE_TELEM);
    }

    #[test]
    fn stored_dtc_reaches_the_wire_once_per_sweep() {
        let (catalog, tx, mut broadcaster) = fixture();
        catalog.store_dtc(codes::APPS1_LOW);
        let mut dtc_frames = 0;
        for _ in 0..DTC_TABLE_SLOTS {
            broadcaster.cycle();
            while let Some(frame) = tx.try_recv() {
                if frame.id == CAN_ID_DTC_TX {
                    dtc_frames += 1;
                    let code = u16::from_be_bytes([frame.payload()[0], frame.payload()[1]]);
                    assert_eq!(code, codes::APPS1_LOW.raw());
                    assert_eq!(frame.payload()[2], 3);
                }
            }
        }
        assert_eq!(dtc_frames, 1);
    }
}
