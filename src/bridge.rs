use crate::can::{CanError, CanFrame};
use crate::fault::{FaultCatalog, InternalFault};
use crate::queue::TopicQueue;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Byte-stream CAN transceiver. Writes are synchronous best-effort; reads
/// deliver whatever chunk of concatenated wire frames the device has
/// buffered, which may hold several frames or a truncated tail.
pub trait CanDevice: Send + Sync + 'static {
    fn write_frame(&self, frame: &CanFrame) -> Result<(), CanError>;
    fn read_chunk(&self) -> impl Future<Output = Result<Vec<u8>, CanError>> + Send;
}

/// Demultiplexer statistics for one inbound chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemuxStats {
    pub accepted: u32,
    pub unrecognized: u32,
    pub dropped_full: u32,
    pub malformed: u32,
}

/// Opens the simulated transceiver, recording a failed open in the catalog.
/// The controller runs on without a bus either way; the fault tables keep
/// filling so a service tool can still read the failure out later.
pub fn open_device(fail: bool, catalog: &FaultCatalog) -> Option<Arc<SimCan>> {
    match SimCan::open(fail) {
        Ok(device) => Some(device),
        Err(err) => {
            error!(%err, "CAN device open failed, running without bus");
            catalog.store_internal_fault(InternalFault::CanOpenFailed);
            None
        }
    }
}

/// Drains `queue` completely onto the device. A rejected write drops that
/// one frame and keeps draining; the bus not taking a frame must never wedge
/// the producers behind it. Re-arms the queue notification after the drain.
pub fn drain_queue<D: CanDevice>(device: &D, queue: &TopicQueue) -> usize {
    let mut written = 0;
    while let Some(frame) = queue.try_recv() {
        match device.write_frame(&frame) {
            Ok(()) => written += 1,
            Err(err) => {
                warn!(topic = queue.name(), id = frame.id, %err, "dropping undeliverable frame");
            }
        }
    }
    queue.arm();
    written
}

/// Outbound bridge task: forwards `drs.tx` and `safing.tx` onto the bus as
/// their readiness notifications fire.
pub async fn run_outbound<D: CanDevice>(
    device: Arc<D>,
    drs_tx: Arc<TopicQueue>,
    safing_tx: Arc<TopicQueue>,
) {
    // Initial arm also catches frames enqueued before the task started.
    drs_tx.arm();
    safing_tx.arm();
    loop {
        tokio::select! {
            () = drs_tx.readable() => {
                let n = drain_queue(device.as_ref(), &drs_tx);
                trace!(topic = drs_tx.name(), frames = n, "drained");
            }
            () = safing_tx.readable() => {
                let n = drain_queue(device.as_ref(), &safing_tx);
                trace!(topic = safing_tx.name(), frames = n, "drained");
            }
        }
    }
}

/// Walks one inbound chunk frame by frame and routes recognized ids to their
/// topic queues. Unrecognized ids are discarded; a full destination queue
/// drops that frame; a malformed record stops the walk since the stream
/// offset can no longer be trusted.
pub fn demux_chunk(buf: &[u8], routes: &[(u32, &TopicQueue)]) -> DemuxStats {
    let mut stats = DemuxStats::default();
    let mut offset = 0;
    while offset < buf.len() {
        let (frame, wire_len) = match CanFrame::decode(&buf[offset..]) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(offset, %err, "malformed inbound frame, discarding rest of chunk");
                stats.malformed += 1;
                break;
            }
        };
        offset += wire_len;
        match routes.iter().find(|(id, _)| *id == frame.id) {
            Some((_, queue)) => {
                if queue.send(frame).is_ok() {
                    stats.accepted += 1;
                } else {
                    debug!(topic = queue.name(), id = frame.id, "inbound queue full, frame dropped");
                    stats.dropped_full += 1;
                }
            }
            None => stats.unrecognized += 1,
        }
    }
    stats
}

/// Inbound bridge task: reads chunks off the device and fans them out to the
/// control topic. Stops when the device closes.
pub async fn run_inbound<D: CanDevice>(device: Arc<D>, drs_rx: Arc<TopicQueue>) {
    let routes: [(u32, &TopicQueue); 1] = [(crate::can::CAN_ID_DRS_CONTROL_RX, drs_rx.as_ref())];
    loop {
        let chunk = match device.read_chunk().await {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(%err, "inbound read failed, stopping bridge");
                return;
            }
        };
        let stats = demux_chunk(&chunk, &routes);
        trace!(?stats, "inbound chunk routed");
    }
}

/// Simulated transceiver: logs outbound frames and replays injected chunks
/// as inbound traffic.
pub struct SimCan {
    tx_log: Mutex<Vec<CanFrame>>,
    write_failure: Mutex<bool>,
    inject_tx: mpsc::Sender<Vec<u8>>,
    inject_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimCan {
    /// Opening the device can itself fail, and the caller is expected to
    /// survive that.
    pub fn open(fail: bool) -> Result<Arc<Self>, CanError> {
        if fail {
            return Err(CanError::OpenFailed);
        }
        let (inject_tx, inject_rx) = mpsc::channel(16);
        Ok(Arc::new(Self {
            tx_log: Mutex::new(Vec::new()),
            write_failure: Mutex::new(false),
            inject_tx,
            inject_rx: tokio::sync::Mutex::new(inject_rx),
        }))
    }

    pub fn set_write_failure(&self, fail: bool) {
        *lock(&self.write_failure) = fail;
    }

    /// Queues a raw chunk for the inbound bridge to read.
    pub async fn inject_chunk(&self, chunk: Vec<u8>) {
        let _ = self.inject_tx.send(chunk).await;
    }

    pub fn transmitted(&self) -> Vec<CanFrame> {
        lock(&self.tx_log).clone()
    }

    pub fn take_transmitted(&self) -> Vec<CanFrame> {
        std::mem::take(&mut lock(&self.tx_log))
    }
}

impl CanDevice for SimCan {
    fn write_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        if *lock(&self.write_failure) {
            return Err(CanError::Backpressure);
        }
        lock(&self.tx_log).push(*frame);
        Ok(())
    }

    async fn read_chunk(&self) -> Result<Vec<u8>, CanError> {
        self.inject_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(CanError::DeviceClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{CAN_ID_DRS_CONTROL_RX, CAN_ID_DTC_TX};
    use crate::queue::TOPIC_DRS_RX;

    fn route_queue() -> TopicQueue {
        TopicQueue::new(TOPIC_DRS_RX)
    }

    #[test]
    fn demux_routes_recognized_and_discards_unknown() {
        let queue = route_queue();
        let mut chunk = CanFrame::extended(CAN_ID_DRS_CONTROL_RX, &[1, 2, 3, 4]).encode_vec();
        chunk.extend(CanFrame::extended(0xDEAD, &[9]).encode_vec());
        chunk.extend(CanFrame::extended(CAN_ID_DRS_CONTROL_RX, &[]).encode_vec());

        let stats = demux_chunk(&chunk, &[(CAN_ID_DRS_CONTROL_RX, &queue)]);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(stats.malformed, 0);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_recv().unwrap().payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn demux_stops_at_malformed_record() {
        let queue = route_queue();
        let mut chunk = CanFrame::extended(CAN_ID_DRS_CONTROL_RX, &[7]).encode_vec();
        // Header claims 8 data bytes but the chunk ends early.
        chunk.extend([0x80, 0, 0, 0x42, 8, 1, 2]);

        let stats = demux_chunk(&chunk, &[(CAN_ID_DRS_CONTROL_RX, &queue)]);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn failed_write_does_not_stall_drain() {
        let device = SimCan::open(false).unwrap();
        let queue = TopicQueue::new("safing.tx");
        queue.send(CanFrame::extended(CAN_ID_DTC_TX, &[1])).unwrap();
        queue.send(CanFrame::extended(CAN_ID_DTC_TX, &[2])).unwrap();

        device.set_write_failure(true);
        assert_eq!(drain_queue(device.as_ref(), &queue), 0);
        assert!(queue.is_empty());
        assert!(device.transmitted().is_empty());
    }
}
