use safingbus::bridge::{self, SimCan};
use safingbus::broadcast::{Broadcaster, BROADCAST_PERIOD};
use safingbus::can::{CAN_ID_BRAKE_TELEM, CAN_ID_DTC_TX, CAN_ID_WHEEL_SPEED_TELEM};
use safingbus::fault::{Dtc, FaultCatalog, FaultWireVersion, DTC_TABLE_SLOTS};
use safingbus::queue::{TopicQueue, TOPIC_DRS_TX, TOPIC_SAFING_TX};
use safingbus::sensors::SensorBank;
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn test_full_sweep_reports_every_stored_dtc() {
    let catalog = Arc::new(FaultCatalog::new(0));
    for n in 1..=DTC_TABLE_SLOTS as u16 {
        catalog.store_dtc(Dtc::powertrain(n));
    }

    let device = SimCan::open(false).unwrap();
    let drs_tx = Arc::new(TopicQueue::new(TOPIC_DRS_TX));
    let safing_tx = Arc::new(TopicQueue::new(TOPIC_SAFING_TX));
    tokio::spawn(bridge::run_outbound(
        Arc::clone(&device),
        Arc::clone(&drs_tx),
        Arc::clone(&safing_tx),
    ));

    let broadcaster = Broadcaster::new(
        Arc::clone(&catalog),
        SensorBank::new(),
        Arc::clone(&safing_tx),
        FaultWireVersion::V2,
    );
    tokio::spawn(broadcaster.run());

    // One full table sweep, one slot per cycle.
    tokio::time::sleep(BROADCAST_PERIOD * (DTC_TABLE_SLOTS as u32 + 1)).await;

    let mut reported = HashSet::new();
    let mut brake_frames = 0;
    let mut wheel_frames = 0;
    for frame in device.transmitted() {
        match frame.id {
            CAN_ID_DTC_TX => {
                reported.insert(u16::from_be_bytes([frame.payload()[0], frame.payload()[1]]));
            }
            CAN_ID_BRAKE_TELEM => brake_frames += 1,
            CAN_ID_WHEEL_SPEED_TELEM => wheel_frames += 1,
            _ => {}
        }
    }

    // Every occupied slot made it to the wire within one sweep, and the
    // telemetry pair rode along every cycle.
    for n in 1..=DTC_TABLE_SLOTS as u16 {
        assert!(reported.contains(&Dtc::powertrain(n).raw()), "missing P{n:04}");
    }
    assert!(brake_frames >= DTC_TABLE_SLOTS as u32);
    assert!(wheel_frames >= DTC_TABLE_SLOTS as u32);
}
