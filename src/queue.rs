use crate::can::CanFrame;
use heapless::Deque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Every topic queue is three frames deep, matching the bus-side buffering
/// the controller was sized for.
pub const TOPIC_QUEUE_DEPTH: usize = 3;

pub const TOPIC_DRS_TX: &str = "drs.tx";
pub const TOPIC_DRS_RX: &str = "drs.rx";
pub const TOPIC_SAFING_TX: &str = "safing.tx";

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("topic queue {0} full")]
    Full(&'static str),
}

type Ring = Deque<CanFrame, TOPIC_QUEUE_DEPTH>;

/// Named, bounded, fixed-message-size, non-blocking channel between one
/// producer task and one consumer task.
///
/// Readiness follows one-shot edge-triggered semantics: a consumer arms the
/// queue with [`TopicQueue::arm`], the first send after arming fires exactly
/// one notification, and no further notification fires until the consumer
/// re-arms. Re-arming after a drain checks for frames that slipped in
/// mid-drain and self-notifies, so a wake-up is never lost.
#[derive(Debug)]
pub struct TopicQueue {
    name: &'static str,
    ring: Mutex<Ring>,
    readable: Notify,
    armed: AtomicBool,
}

fn lock(m: &Mutex<Ring>) -> MutexGuard<'_, Ring> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TopicQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ring: Mutex::new(Deque::new()),
            readable: Notify::new(),
            armed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Non-blocking enqueue. A full queue rejects the frame; the producer
    /// decides whether that loss matters.
    pub fn send(&self, frame: CanFrame) -> Result<(), QueueError> {
        lock(&self.ring)
            .push_back(frame)
            .map_err(|_| QueueError::Full(self.name))?;
        if self.armed.swap(false, Ordering::AcqRel) {
            self.readable.notify_one();
        }
        Ok(())
    }

    /// Non-blocking dequeue in enqueue order.
    pub fn try_recv(&self) -> Option<CanFrame> {
        lock(&self.ring).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.ring).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.ring).is_empty()
    }

    /// Registers the one-shot readiness notification. Must be called only
    /// after a full drain attempt; if a frame arrived mid-drain the
    /// registration consumes itself and notifies immediately.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
        if !self.is_empty() && self.armed.swap(false, Ordering::AcqRel) {
            self.readable.notify_one();
        }
    }

    /// Waits for the next readiness notification.
    pub async fn readable(&self) {
        self.readable.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::CAN_ID_DRS_STATUS_TX;

    fn frame(tag: u8) -> CanFrame {
        CanFrame::extended(CAN_ID_DRS_STATUS_TX, &[tag])
    }

    #[test]
    fn preserves_enqueue_order_and_capacity() {
        let q = TopicQueue::new(TOPIC_DRS_TX);
        for tag in 0..TOPIC_QUEUE_DEPTH as u8 {
            q.send(frame(tag)).unwrap();
        }
        assert_eq!(q.send(frame(9)), Err(QueueError::Full(TOPIC_DRS_TX)));
        for tag in 0..TOPIC_QUEUE_DEPTH as u8 {
            assert_eq!(q.try_recv().unwrap().payload(), &[tag]);
        }
        assert!(q.try_recv().is_none());
    }

    #[tokio::test]
    async fn first_send_after_arm_notifies_once() {
        let q = TopicQueue::new(TOPIC_SAFING_TX);
        q.arm();
        q.send(frame(1)).unwrap();
        q.send(frame(2)).unwrap();
        // Only the arming edge produces a notification; the second send must
        // not queue a second wake-up.
        q.readable().await;
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(10), q.readable())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn rearm_with_pending_frame_self_notifies() {
        let q = TopicQueue::new(TOPIC_SAFING_TX);
        // Frame arrives while unarmed, i.e. mid-drain.
        q.send(frame(1)).unwrap();
        q.arm();
        tokio::time::timeout(std::time::Duration::from_millis(10), q.readable())
            .await
            .expect("re-arm over a non-empty queue must notify");
    }
}
