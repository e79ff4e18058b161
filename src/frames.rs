//! Frame buffer and display pacer
//!
//! Frames arrive whenever the generator produces them and leave at most one
//! per display tick. The buffer is bounded; when full, the oldest frame goes.

use crate::events::VideoFrame;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, trace};

/// Bounded FIFO of frames waiting to be displayed.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<VideoFrame>,
    capacity: usize,
    dropped: u64,
}

impl FrameBuffer {
    /// A buffer holding at most `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Append a frame, evicting from the front while over the bound.
    /// Returns how many frames were evicted.
    pub fn push(&mut self, frame: VideoFrame) -> usize {
        self.frames.push_back(frame);
        let mut evicted = 0;
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.dropped += evicted as u64;
            trace!("Frame buffer full, evicted {} (total {})", evicted, self.dropped);
        }
        evicted
    }

    pub fn pop(&mut self) -> Option<VideoFrame> {
        self.frames.pop_front()
    }

    /// Discard everything buffered. Returns how many frames were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.frames.len();
        self.frames.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by the bound since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &VideoFrame> {
        self.frames.iter()
    }
}

/// Fixed-rate display tick. A tick that fires late is skipped rather than
/// replayed, so the pacer never releases a burst.
pub struct FramePacer {
    ticker: Interval,
    period: Duration,
    running: bool,
}

impl FramePacer {
    /// A stopped pacer ticking every `period` once started.
    pub fn new(period: Duration) -> Self {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            ticker,
            period,
            running: false,
        }
    }

    pub fn start(&mut self) {
        if !self.running {
            self.ticker.reset();
            self.running = true;
            debug!("Frame pacer started at {:?} per tick", self.period);
        }
    }

    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            debug!("Frame pacer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick. Pends forever while stopped, so it is safe to
    /// use as a `select!` branch.
    pub async fn tick(&mut self) {
        if !self.running {
            std::future::pending::<()>().await;
        }
        self.ticker.tick().await;
    }

    /// Release the frame for this tick, if any.
    pub fn release(&mut self, buffer: &mut FrameBuffer) -> Option<VideoFrame> {
        buffer.pop()
    }
}
