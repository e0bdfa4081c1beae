use safingbus::can::{CAN_ID_DTC_TX, CAN_ID_FAULT_TX};
use safingbus::fault::{codes, Dtc, FaultCatalog, FaultWireVersion, InternalFault, DTC_TABLE_SLOTS};

#[test]
fn test_store_is_idempotent_and_keeps_first_timestamp() {
    let catalog = FaultCatalog::new(7);

    catalog.store_dtc(codes::APPS1_LOW);
    let first = catalog.dtc_slot(0).unwrap();

    // Storing the same code again must not consume a slot or touch the
    // original record.
    catalog.store_dtc(codes::APPS1_LOW);
    catalog.store_dtc(codes::APPS1_LOW);

    assert_eq!(catalog.live_dtc_count(), 1);
    let after = catalog.dtc_slot(0).unwrap();
    assert_eq!(after.code, first.code);
    assert_eq!(after.first_seen_ms, first.first_seen_ms);
    assert_eq!(after.keycycle, 7);
}

#[test]
fn test_distinct_codes_fill_slots_in_order() {
    let catalog = FaultCatalog::new(0);
    catalog.store_dtc(codes::BRKF_LOW);
    catalog.store_dtc(codes::BRKR_HIGH);
    catalog.store_dtc(codes::APPS_OOC);

    assert_eq!(catalog.dtc_slot(0).unwrap().code, codes::BRKF_LOW.raw());
    assert_eq!(catalog.dtc_slot(1).unwrap().code, codes::BRKR_HIGH.raw());
    assert_eq!(catalog.dtc_slot(2).unwrap().code, codes::APPS_OOC.raw());
    assert!(catalog.dtc_slot(3).is_none());
}

#[test]
fn test_dtc_overflow_drops_and_raises_meta_fault() {
    let catalog = FaultCatalog::new(0);

    // 16 distinct codes fill the table.
    for n in 1..=DTC_TABLE_SLOTS as u16 {
        catalog.store_dtc(Dtc::powertrain(n));
    }
    assert_eq!(catalog.live_dtc_count(), DTC_TABLE_SLOTS);
    assert_eq!(catalog.dtc_overflows(), 0);

    // The 17th distinct code is dropped; the first 16 are untouched.
    catalog.store_dtc(Dtc::powertrain(17));
    assert_eq!(catalog.live_dtc_count(), DTC_TABLE_SLOTS);
    assert!(!catalog.has_dtc(Dtc::powertrain(17)));
    for n in 1..=DTC_TABLE_SLOTS as u16 {
        assert!(catalog.has_dtc(Dtc::powertrain(n)));
    }

    // The drop itself is observable.
    assert_eq!(catalog.dtc_overflows(), 1);
    assert!(catalog.has_internal_fault(InternalFault::DtcTableOverflow));
}

#[test]
fn test_internal_fault_also_stores_generic_dtc() {
    let catalog = FaultCatalog::new(0);
    catalog.store_internal_fault(InternalFault::CanOpenFailed);

    assert!(catalog.has_internal_fault(InternalFault::CanOpenFailed));
    assert!(catalog.has_dtc(codes::INTERNAL_FAULT));
    assert_eq!(catalog.live_fault_count(), 1);
    assert_eq!(catalog.live_dtc_count(), 1);

    // Repeated internal faults stay idempotent on both tables.
    catalog.store_internal_fault(InternalFault::CanOpenFailed);
    assert_eq!(catalog.live_fault_count(), 1);
    assert_eq!(catalog.live_dtc_count(), 1);
}

#[test]
fn test_fault_record_wire_formats() {
    let catalog = FaultCatalog::new(5);
    catalog.store_dtc(codes::TPS_OOC);
    let record = catalog.dtc_slot(0).unwrap();

    let v2 = record.to_frame(CAN_ID_DTC_TX, FaultWireVersion::V2);
    assert_eq!(v2.id, CAN_ID_DTC_TX);
    assert!(v2.extended);
    assert_eq!(v2.dlc(), 8);
    let code = u16::from_be_bytes([v2.payload()[0], v2.payload()[1]]);
    assert_eq!(code, codes::TPS_OOC.raw());
    assert_eq!(v2.payload()[2], 5);
    let t = u32::from_be_bytes([
        v2.payload()[3],
        v2.payload()[4],
        v2.payload()[5],
        v2.payload()[6],
    ]);
    assert_eq!(t, record.first_seen_ms);
    assert_eq!(v2.payload()[7], 0);

    // The legacy format carries the same fields with a 24-bit timestamp.
    let v1 = record.to_frame(CAN_ID_FAULT_TX, FaultWireVersion::V1);
    assert_eq!(v1.dlc(), 7);
    assert_eq!(&v1.payload()[..3], &v2.payload()[..3]);
    let t24 = u32::from_be_bytes([0, v1.payload()[3], v1.payload()[4], v1.payload()[5]]);
    assert_eq!(t24, record.first_seen_ms & 0x00ff_ffff);
}

#[test]
fn test_dtc_display_uses_category_letter() {
    assert_eq!(codes::RAIL_SENSE_STG.to_string(), "P0001");
    assert_eq!(codes::INTERNAL_FAULT.to_string(), "U3000");
}
