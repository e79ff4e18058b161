//! Sequential speech playback.

pub mod output;
pub mod queue;

pub use output::{
    encode_wav, wav_duration, AudioOutput, ManualOutput, ManualOutputHandle, PlaybackFinished,
    PlaybackNotifier, WavClockOutput,
};
#[cfg(feature = "pulse")]
pub use output::PulseOutput;
pub use queue::{AudioPlaybackQueue, QueueEvent, FIRST_SEQUENCE};
