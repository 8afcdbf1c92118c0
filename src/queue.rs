//! Bounded queue between the receive task and the frame-sink task
//! (SPEC_FULL.md §5 "Backpressure vs. loss"). On overflow the oldest
//! non-keyframe is dropped first; only once no non-keyframe remains does the
//! oldest keyframe give way.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::h264::depacketizer::AccessUnit;
use crate::stats::Stats;

pub struct FrameQueue {
    inner: Mutex<VecDeque<AccessUnit>>,
    notify: Notify,
    capacity: usize,
    closed: std::sync::atomic::AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        FrameQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Pushes one access unit, evicting to stay within capacity. Counts every
    /// eviction as a frame drop.
    pub async fn push(&self, unit: AccessUnit, stats: &Stats) {
        let mut guard = self.inner.lock().await;
        if guard.len() >= self.capacity {
            let evict_at = guard.iter().position(|u| !u.is_keyframe).unwrap_or(0);
            guard.remove(evict_at);
            stats.frame_dropped();
        }
        guard.push_back(unit);
        drop(guard);
        self.notify.notify_one();
    }

    /// Waits for the next access unit, or `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<AccessUnit> {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(unit) = guard.pop_front() {
                    return Some(unit);
                }
                if self.closed.load(std::sync::atomic::Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Signals no further pushes are coming; queued units still drain.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(timestamp: u32, is_keyframe: bool) -> AccessUnit {
        AccessUnit {
            timestamp,
            data: vec![0, 0, 0, 1, 0x41],
            is_keyframe,
        }
    }

    #[tokio::test]
    async fn drops_oldest_non_keyframe_first() {
        let stats = Stats::default();
        let queue = FrameQueue::new(2);
        queue.push(unit(1, true), &stats).await;
        queue.push(unit(2, false), &stats).await;
        queue.push(unit(3, false), &stats).await;

        let first = queue.pop().await.unwrap();
        assert_eq!(first.timestamp, 1);
        let second = queue.pop().await.unwrap();
        assert_eq!(second.timestamp, 3);
        assert_eq!(stats.frames_dropped(), 1);
    }

    #[tokio::test]
    async fn drops_oldest_keyframe_when_no_non_keyframe_remains() {
        let stats = Stats::default();
        let queue = FrameQueue::new(2);
        queue.push(unit(1, true), &stats).await;
        queue.push(unit(2, true), &stats).await;
        queue.push(unit(3, true), &stats).await;

        let first = queue.pop().await.unwrap();
        assert_eq!(first.timestamp, 2);
        assert_eq!(stats.frames_dropped(), 1);
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_and_drain() {
        let stats = Stats::default();
        let queue = FrameQueue::new(2);
        queue.push(unit(1, true), &stats).await;
        queue.close();
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }
}
