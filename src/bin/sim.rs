use clap::{App, Arg};
use safingbus::board::{SafingBoard, SimBoard, SimFailures};
use safingbus::bridge;
use safingbus::broadcast::Broadcaster;
use safingbus::fault::{FaultCatalog, FaultWireVersion};
use safingbus::flags;
use safingbus::queue::{TopicQueue, TOPIC_DRS_RX, TOPIC_DRS_TX, TOPIC_SAFING_TX};
use safingbus::safing::{RailSenseRetry, SafingSequencer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::info;

#[derive(Serialize)]
struct StatusReport<'a> {
    uptime_secs: u64,
    arm_state: safingbus::ArmState,
    live_dtcs: usize,
    live_faults: usize,
    frames_on_wire: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<&'a str>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("safingbus-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Throttle-by-wire safing controller against a simulated board and bus")
        .arg(
            Arg::with_name("keycycle")
                .long("keycycle")
                .value_name("N")
                .help("Key cycle counter stamped into fault records")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::with_name("wire-format")
                .long("wire-format")
                .value_name("VERSION")
                .help("Fault record wire format")
                .possible_values(&["v1", "v2"])
                .takes_value(true)
                .default_value("v2"),
        )
        .arg(
            Arg::with_name("fail-arm-step")
                .long("fail-arm-step")
                .value_name("STEP")
                .help("Reject one board arm step to exercise the abort path")
                .possible_values(&["rail-sense", "plausibility", "safing"])
                .takes_value(true),
        )
        .arg(
            Arg::with_name("inject-flags")
                .long("inject-flags")
                .value_name("HEX")
                .help("Fault flag word to latch after arming, e.g. 0x21")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("fail-can-open")
                .long("fail-can-open")
                .help("Make the CAN device fail to open"),
        )
        .arg(
            Arg::with_name("run-secs")
                .long("run-secs")
                .value_name("SECS")
                .help("Exit after this many seconds (runs forever when omitted)")
                .takes_value(true),
        )
        .get_matches();

    let keycycle: u8 = matches.value_of("keycycle").unwrap_or("0").parse()?;
    let wire_version = match matches.value_of("wire-format") {
        Some("v1") => FaultWireVersion::V1,
        _ => FaultWireVersion::V2,
    };
    let failures = match matches.value_of("fail-arm-step") {
        Some("rail-sense") => SimFailures {
            rail_sense_enable: true,
            ..Default::default()
        },
        Some("plausibility") => SimFailures {
            plausibility_arm: true,
            ..Default::default()
        },
        Some("safing") => SimFailures {
            safing_arm: true,
            ..Default::default()
        },
        _ => SimFailures::default(),
    };
    let inject_flags = match matches.value_of("inject-flags") {
        Some(hex) => Some(u32::from_str_radix(hex.trim_start_matches("0x"), 16)?),
        None => None,
    };
    let run_secs: Option<u64> = match matches.value_of("run-secs") {
        Some(s) => Some(s.parse()?),
        None => None,
    };

    let board = Arc::new(SimBoard::with_failures(failures));
    let catalog = Arc::new(FaultCatalog::new(keycycle));
    let drs_tx = Arc::new(TopicQueue::new(TOPIC_DRS_TX));
    let drs_rx = Arc::new(TopicQueue::new(TOPIC_DRS_RX));
    let safing_tx = Arc::new(TopicQueue::new(TOPIC_SAFING_TX));

    let device = bridge::open_device(matches.is_present("fail-can-open"), &catalog);

    let mut sequencer = SafingSequencer::new(Arc::clone(&board), Arc::clone(&catalog));
    let arm_state = sequencer.arm().await;
    info!(?arm_state, "arm sequence finished");

    // Notification processing starts only after arming settles.
    let (retry, trigger) = RailSenseRetry::new(Arc::clone(&board), Arc::clone(&catalog));
    tokio::spawn(retry.run());
    tokio::spawn(flags::run_dispatch(
        sequencer.into_subscription(),
        Arc::clone(&catalog),
        trigger,
    ));

    if let Some(device) = &device {
        tokio::spawn(bridge::run_outbound(
            Arc::clone(device),
            Arc::clone(&drs_tx),
            Arc::clone(&safing_tx),
        ));
        tokio::spawn(bridge::run_inbound(Arc::clone(device), Arc::clone(&drs_rx)));
    }

    let broadcaster = Broadcaster::new(
        Arc::clone(&catalog),
        board.sensors().clone(),
        Arc::clone(&safing_tx),
        wire_version,
    );
    tokio::spawn(broadcaster.run());

    if let Some(word) = inject_flags {
        board.raise_flags(word);
        info!(flags = %format_args!("{word:#x}"), "injected fault flags");
    }

    let started = std::time::Instant::now();
    let mut ticker = time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let report = StatusReport {
            uptime_secs: started.elapsed().as_secs(),
            arm_state,
            live_dtcs: catalog.live_dtc_count(),
            live_faults: catalog.live_fault_count(),
            frames_on_wire: device.as_ref().map_or(0, |d| d.transmitted().len()),
            note: device.is_none().then_some("bus offline"),
        };
        println!("{}", serde_json::to_string(&report)?);

        if let Some(limit) = run_secs {
            if started.elapsed().as_secs() >= limit {
                break;
            }
        }
    }

    Ok(())
}
