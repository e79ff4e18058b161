//! Audio outputs
//!
//! An output starts a chunk and later reports, exactly once, that the
//! chunk's audio has ended. The queue never advances on anything else.

use crate::error::MediaDecodeError;
use crate::events::AudioChunk;
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Completion report for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackFinished {
    pub sequence: u64,
    /// Set when playback broke off instead of reaching the natural end.
    pub error: Option<String>,
}

/// Sending half of the playback completion channel.
#[derive(Debug, Clone)]
pub struct PlaybackNotifier {
    tx: mpsc::UnboundedSender<PlaybackFinished>,
}

impl PlaybackNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PlaybackFinished>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn finished(&self, sequence: u64) {
        let _ = self.tx.send(PlaybackFinished { sequence, error: None });
    }

    pub fn failed(&self, sequence: u64, error: impl Into<String>) {
        let _ = self.tx.send(PlaybackFinished {
            sequence,
            error: Some(error.into()),
        });
    }
}

/// Something that can play one chunk at a time.
pub trait AudioOutput: Send + 'static {
    /// Start playing `chunk` and return without waiting for it to end.
    ///
    /// Returns an error if the payload cannot be played at all; in that case
    /// nothing is reported through `notifier`.
    fn play(&mut self, chunk: &AudioChunk, notifier: &PlaybackNotifier) -> Result<(), MediaDecodeError>;

    /// Cut the current chunk short. No completion is reported for it.
    fn stop(&mut self);
}

/// Natural playing time of a WAV payload.
pub fn wav_duration(bytes: &[u8]) -> Result<Duration, MediaDecodeError> {
    if bytes.is_empty() {
        return Err(MediaDecodeError::Empty);
    }
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(MediaDecodeError::Unsupported(format!(
            "{} Hz, {} channels",
            spec.sample_rate, spec.channels
        )));
    }
    Ok(Duration::from_secs_f64(
        f64::from(reader.duration()) / f64::from(spec.sample_rate),
    ))
}

/// Encode 16-bit mono samples as a WAV payload.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, MediaDecodeError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in samples {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Headless output: validates the WAV and reports the end once the clip's
/// natural duration has passed on the runtime clock. For hosts without an
/// audio device.
#[derive(Debug, Default)]
pub struct WavClockOutput {
    pending: Option<JoinHandle<()>>,
}

impl WavClockOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioOutput for WavClockOutput {
    fn play(&mut self, chunk: &AudioChunk, notifier: &PlaybackNotifier) -> Result<(), MediaDecodeError> {
        let duration = wav_duration(&chunk.audio)?;
        let sequence = chunk.sequence;
        let notifier = notifier.clone();
        debug!("Clocking chunk {} for {:?}", sequence, duration);

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            notifier.finished(sequence);
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for WavClockOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
struct ManualState {
    started: Vec<u64>,
    playing: Option<u64>,
    notifier: Option<PlaybackNotifier>,
    rejected: HashSet<u64>,
    overlapped: bool,
    stopped: usize,
}

/// Output driven by its owner: the host plays the audio itself and calls
/// `ManualOutputHandle::finish` when the audio element ends.
#[derive(Debug, Clone, Default)]
pub struct ManualOutput {
    state: Arc<Mutex<ManualState>>,
}

/// Control side of a `ManualOutput`.
#[derive(Debug, Clone)]
pub struct ManualOutputHandle {
    state: Arc<Mutex<ManualState>>,
}

impl ManualOutput {
    pub fn new() -> (Self, ManualOutputHandle) {
        let output = Self::default();
        let handle = ManualOutputHandle { state: output.state.clone() };
        (output, handle)
    }
}

impl AudioOutput for ManualOutput {
    fn play(&mut self, chunk: &AudioChunk, notifier: &PlaybackNotifier) -> Result<(), MediaDecodeError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| MediaDecodeError::Device("output state poisoned".into()))?;
        if state.rejected.contains(&chunk.sequence) {
            return Err(MediaDecodeError::Unsupported(format!("chunk {} rejected", chunk.sequence)));
        }
        if state.playing.is_some() {
            state.overlapped = true;
        }
        state.started.push(chunk.sequence);
        state.playing = Some(chunk.sequence);
        state.notifier = Some(notifier.clone());
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.playing = None;
            state.stopped += 1;
        }
    }
}

impl ManualOutputHandle {
    /// Report the natural end of `sequence`. Returns false if it is not playing.
    pub fn finish(&self, sequence: u64) -> bool {
        self.complete(sequence, None)
    }

    /// Report that `sequence` broke off mid-playback.
    pub fn fail(&self, sequence: u64, reason: &str) -> bool {
        self.complete(sequence, Some(reason.to_string()))
    }

    /// Finish whatever is playing and return its sequence.
    pub fn finish_current(&self) -> Option<u64> {
        let sequence = self.playing()?;
        self.finish(sequence).then_some(sequence)
    }

    /// Make the next `play` of `sequence` fail to decode.
    pub fn reject(&self, sequence: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.rejected.insert(sequence);
        }
    }

    /// Sequences in the order playback started.
    pub fn started(&self) -> Vec<u64> {
        self.state.lock().map(|s| s.started.clone()).unwrap_or_default()
    }

    pub fn playing(&self) -> Option<u64> {
        self.state.lock().ok().and_then(|s| s.playing)
    }

    /// True if a chunk was ever started while another was playing.
    pub fn overlapped(&self) -> bool {
        self.state.lock().map(|s| s.overlapped).unwrap_or(false)
    }

    /// Number of `stop` calls received.
    pub fn stops(&self) -> usize {
        self.state.lock().map(|s| s.stopped).unwrap_or(0)
    }

    fn complete(&self, sequence: u64, error: Option<String>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.playing != Some(sequence) {
            return false;
        }
        state.playing = None;
        match (state.notifier.as_ref(), error) {
            (Some(notifier), None) => notifier.finished(sequence),
            (Some(notifier), Some(reason)) => notifier.failed(sequence, reason),
            (None, _) => return false,
        }
        true
    }
}

#[cfg(feature = "pulse")]
pub use pulse::PulseOutput;

#[cfg(feature = "pulse")]
mod pulse {
    //! PulseAudio output using the simple API on a blocking thread.

    use super::{AudioOutput, PlaybackNotifier};
    use crate::error::MediaDecodeError;
    use crate::events::AudioChunk;
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tracing::{debug, error};

    /// ~20ms of 16 kHz mono audio; the stop flag is checked between blocks.
    const BLOCK_BYTES: usize = 640;

    pub struct PulseOutput {
        app_name: String,
        cancel: Arc<AtomicBool>,
    }

    impl PulseOutput {
        pub fn new(app_name: &str) -> Self {
            Self {
                app_name: app_name.to_string(),
                cancel: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl AudioOutput for PulseOutput {
        fn play(&mut self, chunk: &AudioChunk, notifier: &PlaybackNotifier) -> Result<(), MediaDecodeError> {
            let (spec, pcm) = decode_pcm16(&chunk.audio)?;

            let cancel = Arc::new(AtomicBool::new(false));
            self.cancel = cancel.clone();

            let app_name = self.app_name.clone();
            let sequence = chunk.sequence;
            let notifier = notifier.clone();

            tokio::task::spawn_blocking(move || {
                let result = play_blocking(&app_name, &spec, &pcm, &cancel);
                if cancel.load(Ordering::Relaxed) {
                    debug!("Chunk {} stopped before the end", sequence);
                    return;
                }
                match result {
                    Ok(()) => notifier.finished(sequence),
                    Err(e) => {
                        error!("PulseAudio playback of chunk {} failed: {}", sequence, e);
                        notifier.failed(sequence, e.to_string());
                    }
                }
            });
            Ok(())
        }

        fn stop(&mut self) {
            self.cancel.store(true, Ordering::Relaxed);
        }
    }

    impl Drop for PulseOutput {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn decode_pcm16(bytes: &[u8]) -> Result<(Spec, Vec<u8>), MediaDecodeError> {
        if bytes.is_empty() {
            return Err(MediaDecodeError::Empty);
        }
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        let wav = reader.spec();
        if wav.bits_per_sample != 16 || wav.sample_format != hound::SampleFormat::Int {
            return Err(MediaDecodeError::Unsupported(format!(
                "{}-bit {:?}",
                wav.bits_per_sample, wav.sample_format
            )));
        }

        let spec = Spec {
            format: Format::S16le,
            channels: u8::try_from(wav.channels)
                .map_err(|_| MediaDecodeError::Unsupported(format!("{} channels", wav.channels)))?,
            rate: wav.sample_rate,
        };
        if !spec.is_valid() {
            return Err(MediaDecodeError::Unsupported(format!("{:?}", spec)));
        }

        let samples = reader.into_samples::<i16>().collect::<Result<Vec<_>, _>>()?;
        let pcm = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Ok((spec, pcm))
    }

    fn play_blocking(
        app_name: &str,
        spec: &Spec,
        pcm: &[u8],
        cancel: &AtomicBool,
    ) -> Result<(), MediaDecodeError> {
        let simple = Simple::new(
            None,
            app_name,
            Direction::Playback,
            None,
            "speech",
            spec,
            None,
            None,
        )
        .map_err(|e| MediaDecodeError::Device(e.to_string()))?;

        for block in pcm.chunks(BLOCK_BYTES) {
            if cancel.load(Ordering::Relaxed) {
                let _ = simple.flush();
                return Ok(());
            }
            simple
                .write(block)
                .map_err(|e| MediaDecodeError::Device(e.to_string()))?;
        }

        simple.drain().map_err(|e| MediaDecodeError::Device(e.to_string()))
    }
}
