//! Reply latency tracking: time from sending a user message until the first
//! chunk of the reply starts playing.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const MAX_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub samples: usize,
    pub last: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

#[derive(Debug, Default)]
pub struct LatencyTracker {
    waiting_since: Option<Instant>,
    samples: VecDeque<Duration>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A user message went out. A message sent while an earlier one is still
    /// unanswered keeps the earlier start.
    pub fn message_sent(&mut self) {
        if self.waiting_since.is_none() {
            self.waiting_since = Some(Instant::now());
        }
    }

    /// Audio started playing. Completes the pending sample, if any.
    pub fn audio_started(&mut self) -> Option<Duration> {
        let since = self.waiting_since.take()?;
        let latency = since.elapsed();
        self.samples.push_back(latency);
        if self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        info!(
            "⏱️ Time to first audio: {:.2}s ({}ms), avg {:?}",
            latency.as_secs_f32(),
            latency.as_millis(),
            self.average()
        );
        Some(latency)
    }

    /// Forget an unanswered message, e.g. after the control channel dropped.
    pub fn abandon(&mut self) {
        self.waiting_since = None;
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_since.is_some()
    }

    fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            None
        } else {
            let sum: Duration = self.samples.iter().sum();
            Some(sum / self.samples.len() as u32)
        }
    }

    pub fn summary(&self) -> Option<LatencySummary> {
        let last = *self.samples.back()?;
        let min = *self.samples.iter().min()?;
        let max = *self.samples.iter().max()?;
        let avg = self.average()?;
        Some(LatencySummary {
            samples: self.samples.len(),
            last,
            min,
            max,
            avg,
        })
    }

    pub fn log_summary(&self) {
        match self.summary() {
            Some(s) => info!(
                "📊 Latency over last {} replies: min {}ms, max {}ms, avg {}ms",
                s.samples,
                s.min.as_millis(),
                s.max.as_millis(),
                s.avg.as_millis()
            ),
            None => info!("📊 No reply latency samples yet"),
        }
    }
}
