//! Latest-frame bus between the capture and render threads
//!
//! A single slot, not a queue: the producer overwrites, the consumer reads
//! whatever is newest. A slow consumer silently skips intermediate frames,
//! which keeps both memory and display latency bounded.

use crate::Frame;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Slot {
    frame: Option<Arc<Frame>>,
    updates: u64,
}

/// Single-slot, mutex-guarded latest-frame register
#[derive(Default)]
pub struct FrameBus {
    slot: Mutex<Slot>,
}

impl FrameBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A producer that panicked mid-update still leaves a valid slot behind.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite the slot with a new frame
    pub fn update(&self, frame: Frame) {
        self.update_shared(Arc::new(frame));
    }

    /// Overwrite the slot with an already shared frame
    pub fn update_shared(&self, frame: Arc<Frame>) {
        let previous = {
            let mut slot = self.lock();
            slot.updates += 1;
            slot.frame.replace(frame)
        };
        // The replaced frame is freed after the lock is released.
        drop(previous);
    }

    /// Latest frame, if any has been published.
    ///
    /// The slot keeps the frame, so a consumer that runs faster than the
    /// producer sees the same image again rather than nothing.
    pub fn take(&self) -> Option<Arc<Frame>> {
        self.lock().frame.clone()
    }

    /// Total number of `update` calls
    pub fn frame_count(&self) -> u64 {
        self.lock().updates
    }

    /// Drop the held frame (the counter is kept)
    pub fn clear(&self) {
        let previous = self.lock().frame.take();
        drop(previous);
    }
}
