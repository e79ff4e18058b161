//! Audio playback queue
//!
//! Chunks play strictly one at a time in `sequence` order. A chunk whose
//! predecessor has not arrived yet waits; the next chunk starts only when the
//! output reports the current one has ended.

use super::output::{AudioOutput, PlaybackFinished, PlaybackNotifier};
use crate::events::{AudioChunk, ChunkKind};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Sequence numbers handed out by the control client start here.
pub const FIRST_SEQUENCE: u64 = 1;

/// Transitions of the playback queue, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Started { sequence: u64, text: String, kind: ChunkKind },
    Finished { sequence: u64 },
    /// The chunk could not be played (or broke off) and was passed over.
    Skipped { sequence: u64, reason: String },
    /// Nothing playing and nothing waiting.
    Drained,
}

pub struct AudioPlaybackQueue<O: AudioOutput> {
    output: O,
    notifier: PlaybackNotifier,
    pending: BTreeMap<u64, AudioChunk>,
    current: Option<AudioChunk>,
    next_sequence: u64,
}

impl<O: AudioOutput> AudioPlaybackQueue<O> {
    pub fn new(output: O, notifier: PlaybackNotifier) -> Self {
        Self {
            output,
            notifier,
            pending: BTreeMap::new(),
            current: None,
            next_sequence: FIRST_SEQUENCE,
        }
    }

    /// Add a chunk. If the queue is idle and this is the next chunk in order,
    /// playback starts before this call returns.
    pub fn enqueue(&mut self, chunk: AudioChunk) -> Vec<QueueEvent> {
        if chunk.sequence < self.next_sequence || self.pending.contains_key(&chunk.sequence) {
            warn!("Dropping duplicate or late chunk {}", chunk.sequence);
            return Vec::new();
        }

        debug!(
            "Queued chunk {} ({} bytes, {} waiting)",
            chunk.sequence,
            chunk.audio.len(),
            self.pending.len()
        );
        self.pending.insert(chunk.sequence, chunk);

        let mut events = Vec::new();
        self.advance(&mut events);
        self.check_drained(&mut events);
        events
    }

    /// Handle the output's end-of-audio report.
    pub fn on_playback_finished(&mut self, finished: PlaybackFinished) -> Vec<QueueEvent> {
        match &self.current {
            Some(chunk) if chunk.sequence == finished.sequence => {}
            _ => {
                debug!("Ignoring stale completion for chunk {}", finished.sequence);
                return Vec::new();
            }
        }
        self.current = None;

        let mut events = Vec::new();
        match finished.error {
            None => {
                debug!("Chunk {} finished", finished.sequence);
                events.push(QueueEvent::Finished { sequence: finished.sequence });
            }
            Some(reason) => {
                warn!("Chunk {} broke off: {}", finished.sequence, reason);
                events.push(QueueEvent::Skipped { sequence: finished.sequence, reason });
            }
        }

        self.advance(&mut events);
        self.check_drained(&mut events);
        events
    }

    fn advance(&mut self, events: &mut Vec<QueueEvent>) {
        while self.current.is_none() {
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            if *entry.key() != self.next_sequence {
                debug!("Waiting for chunk {} before {}", self.next_sequence, entry.key());
                break;
            }

            let chunk = entry.remove();
            self.next_sequence = chunk.sequence + 1;

            match self.output.play(&chunk, &self.notifier) {
                Ok(()) => {
                    info!("🔊 Playing chunk {}: {}", chunk.sequence, preview(&chunk.text));
                    events.push(QueueEvent::Started {
                        sequence: chunk.sequence,
                        text: chunk.text.clone(),
                        kind: chunk.kind,
                    });
                    self.current = Some(chunk);
                }
                Err(e) => {
                    warn!("Skipping chunk {}: {}", chunk.sequence, e);
                    events.push(QueueEvent::Skipped {
                        sequence: chunk.sequence,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn check_drained(&self, events: &mut Vec<QueueEvent>) {
        if !events.is_empty() && self.current.is_none() && self.pending.is_empty() {
            events.push(QueueEvent::Drained);
        }
    }

    /// The chunk currently playing.
    pub fn now_playing(&self) -> Option<&AudioChunk> {
        self.current.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Chunks received but not started yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Stop the output and discard everything, without emitting events.
    pub fn clear(&mut self) -> usize {
        let discarded = self.pending.len() + usize::from(self.current.is_some());
        if self.current.take().is_some() {
            self.output.stop();
        }
        self.pending.clear();
        discarded
    }
}

impl<O: AudioOutput> Drop for AudioPlaybackQueue<O> {
    fn drop(&mut self) {
        self.clear();
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
