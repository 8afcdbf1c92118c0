//! Running counters published by the receive loop and read by the
//! orchestrator/CLI (SPEC_FULL.md §3 "Statistics record").

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    access_units_emitted: AtomicU64,
    keyframes_emitted: AtomicU64,
    packets_dropped: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Stats {
    pub fn packet_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn access_unit_emitted(&self, is_keyframe: bool) {
        self.access_units_emitted.fetch_add(1, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn packets_dropped_add(&self, n: u64) {
        self.packets_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_received_count(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received_count(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn access_units_emitted_count(&self) -> u64 {
        self.access_units_emitted.load(Ordering::Relaxed)
    }

    pub fn keyframes_emitted_count(&self) -> u64 {
        self.keyframes_emitted.load(Ordering::Relaxed)
    }

    pub fn packets_dropped_count(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}
