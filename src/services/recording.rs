//! Per-direction media recording
//!
//! The bridge records raw RTP frames as they cross it, one file per
//! direction and medium. The container kept here is deliberately minimal
//! (a JSON header line followed by length-prefixed frames); post-processing
//! into a playable file is the job of external tooling, which is why the
//! codec name and RED payload type are stored up front.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Debug, Serialize)]
struct RecordingHeader<'a> {
    codec: &'a str,
    created: i64,
}

/// An open recording target for one direction of one medium.
pub struct Recorder {
    filename: String,
    path: PathBuf,
    codec: String,
    opusred_pt: Option<i32>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl Recorder {
    /// Open a new recording file. `filename` is used as-is plus the
    /// container extension; the codec name is whatever the negotiation
    /// settled on for the medium being tapped.
    pub fn create(dir: Option<&Path>, codec: &str, filename: &str) -> Result<Self> {
        let mut path = dir.map(Path::to_path_buf).unwrap_or_default();
        path.push(format!("{filename}.mrec"));
        let file = File::create(&path)
            .map_err(|e| Error::recording(format!("Couldn't open {}: {e}", path.display())))?;
        let mut writer = BufWriter::new(file);

        let header = RecordingHeader {
            codec,
            created: Utc::now().timestamp_micros(),
        };
        serde_json::to_writer(&mut writer, &header)
            .map_err(|e| Error::recording(format!("Couldn't write recording header: {e}")))
            .and_then(|()| {
                writer
                    .write_all(b"\n")
                    .map_err(|e| Error::recording(format!("Couldn't write recording header: {e}")))
            })?;

        debug!("Recording {} ({codec}) opened", path.display());
        Ok(Self {
            filename: filename.to_string(),
            path,
            codec: codec.to_string(),
            opusred_pt: None,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Note that the recorded audio stream carries RFC 2198 redundancy.
    /// Side information only; frames are still written as received.
    pub fn set_opusred(&mut self, pt: i32) {
        self.opusred_pt = Some(pt);
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn opusred_pt(&self) -> Option<i32> {
        self.opusred_pt
    }

    /// Append one frame. Saving to a closed recorder is a no-op, so the
    /// packet paths never need to coordinate with recording stop.
    pub fn save_frame(&self, frame: &[u8]) {
        let mut guard = self.writer.lock().unwrap();
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let len = frame.len() as u32;
        if let Err(e) = writer
            .write_all(&len.to_be_bytes())
            .and_then(|()| writer.write_all(frame))
        {
            warn!("Error writing frame to {}: {e}", self.path.display());
        }
    }

    /// Flush and close the file. Idempotent.
    pub fn close(&self) {
        let mut guard = self.writer.lock().unwrap();
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.flush() {
                warn!("Error flushing recording {}: {e}", self.path.display());
            }
        }
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("filename", &self.filename)
            .field("codec", &self.codec)
            .field("opusred_pt", &self.opusred_pt)
            .finish()
    }
}
