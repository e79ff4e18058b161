//! Session recorder for debugging - saves played chunks and rendered frames

use crate::events::{AudioChunk, VideoFrame};
use chrono::Local;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub struct SessionRecorder {
    dir: Option<PathBuf>, // <record_dir>/20250603_153055/
    frames: u64,
}

impl SessionRecorder {
    /// Record under a timestamped directory inside `base`, or not at all.
    pub fn new(base: Option<&Path>) -> Self {
        let Some(base) = base else {
            return Self::disabled();
        };

        let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let dir = base.join(ts);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                info!("Recording enabled, saving to: {:?}", dir);
                Self { dir: Some(dir), frames: 0 }
            }
            Err(e) => {
                error!("Failed to create recordings directory {:?}: {}", dir, e);
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { dir: None, frames: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Save a chunk's audio and transcript as it starts playing.
    pub fn record_chunk(&mut self, chunk: &AudioChunk) {
        let Some(dir) = &self.dir else {
            return;
        };
        let stem = format!("chunk_{:04}", chunk.sequence);
        write_file(&dir.join(format!("{}.wav", stem)), &chunk.audio);
        write_file(&dir.join(format!("{}.txt", stem)), chunk.text.as_bytes());
    }

    /// Save a frame as it is handed to the presentation layer.
    pub fn record_frame(&mut self, frame: &VideoFrame) {
        let Some(dir) = &self.dir else {
            return;
        };
        self.frames += 1;
        write_file(&dir.join(format!("frame_{:06}.jpg", self.frames)), &frame.image);
    }
}

fn write_file(path: &Path, bytes: &[u8]) {
    match File::create(path) {
        Ok(mut file) => {
            if let Err(e) = file.write_all(bytes) {
                error!("Failed to write {:?}: {}", path, e);
            } else {
                debug!("Saved {:?}", path);
            }
        }
        Err(e) => {
            error!("Failed to create {:?}: {}", path, e);
        }
    }
}
