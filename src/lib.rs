//! # Safing Bus Controller
//!
//! A throttle-by-wire safing controller library: arms a hardware safing
//! interlock at startup, latches plausibility faults into bounded diagnostic
//! tables, and bridges bounded topic queues onto a CAN bus.
//!
//! ## Features
//!
//! - **Arm sequencing**: Multi-step interlock arm protocol with settle
//!   delays and short-circuit abort
//! - **Fault management**: Fixed 16-slot DTC and internal-fault tables with
//!   idempotent first-occurrence capture
//! - **Async fault dispatch**: Latched fault-flag word fanned out to fault
//!   sinks over a watch channel
//! - **CAN bridging**: Edge-triggered outbound drains and DLC-walking
//!   inbound demultiplexing
//! - **Periodic broadcast**: Round-robin fault reporting plus brake and
//!   wheel-speed telemetry
//! - **Embedded-friendly**: Bounded queues and tables, no unbounded growth
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use safingbus::board::SimBoard;
//! use safingbus::fault::FaultCatalog;
//! use safingbus::safing::SafingSequencer;
//!
//! # async fn demo() {
//! let board = Arc::new(SimBoard::new());
//! let catalog = Arc::new(FaultCatalog::new(0));
//! let mut sequencer = SafingSequencer::new(board, Arc::clone(&catalog));
//!
//! let state = sequencer.arm().await;
//! println!("arm finished in {state:?}, {} DTCs live", catalog.live_dtc_count());
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`safing`] - Arm sequencer and rail-sense retry sub-machine
//! - [`fault`] - DTC encoding and the bounded fault catalog
//! - [`flags`] - Fault-flag word dispatch to catalog sinks
//! - [`board`] - Hardware abstraction seam and the simulated board
//! - [`queue`] - Bounded topic queues with one-shot readiness
//! - [`bridge`] - Outbound and inbound CAN bridge tasks
//! - [`broadcast`] - Periodic fault and telemetry reporter
//! - [`gate`] - Pause gate serializing sensor consumption

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

pub mod board;
pub mod bridge;
pub mod broadcast;
pub mod can;
pub mod fault;
pub mod flags;
pub mod gate;
pub mod queue;
pub mod safing;
pub mod sensors;

// Re-export main public types for convenience
pub use board::{SafingBoard, SimBoard};
pub use can::CanFrame;
pub use fault::{Dtc, FaultCatalog, InternalFault};
pub use queue::TopicQueue;
pub use safing::{ArmState, SafingSequencer};
