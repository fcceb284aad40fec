#[cfg(test)]
mod writer_test;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};

use super::{media_path, InfoHeader, FRAME_TAG, INFO_TAG};
use crate::error::{Error, Result};

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// MjrWriter appends RTP packets of a single medium to a capture file.
///
/// The file and its info header only come into existence with the first
/// saved frame, so a negotiated medium that never produced media leaves no
/// file behind. Callers serialize access through the owning session.
pub struct MjrWriter {
    path: PathBuf,
    codec: String,
    video: bool,
    created: i64,
    file: Option<File>,
    frames: u64,
    closed: bool,
}

impl MjrWriter {
    /// Prepares a writer for `<dir>/<name>.mjr`. Nothing is written yet.
    pub fn new(dir: &Path, codec: &str, video: bool, name: &str) -> MjrWriter {
        MjrWriter {
            path: media_path(dir, name),
            codec: codec.to_owned(),
            video,
            created: now_micros(),
            file: None,
            frames: 0,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of frames saved so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Appends one RTP packet. The info header is emitted ahead of the first
    /// frame so its `u` field carries the real first-write time.
    pub fn save_frame(&mut self, packet: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::ErrRecorderClosed);
        }
        if packet.is_empty() || packet.len() > u16::MAX as usize {
            return Err(Error::ErrInvalidRecordHeader);
        }
        if self.file.is_none() {
            self.write_info_header()?;
        }
        let file = self.file.as_mut().ok_or(Error::ErrRecorderClosed)?;
        file.write_all(FRAME_TAG)?;
        file.write_u16::<BigEndian>(packet.len() as u16)?;
        file.write_all(packet)?;
        self.frames += 1;
        Ok(())
    }

    fn write_info_header(&mut self) -> Result<()> {
        let mut file = File::create(&self.path)?;
        let info = InfoHeader {
            t: if self.video { "v" } else { "a" }.to_owned(),
            c: self.codec.clone(),
            s: self.created,
            u: now_micros(),
        };
        let raw = serde_json::to_vec(&info)?;
        file.write_all(INFO_TAG)?;
        file.write_u16::<BigEndian>(raw.len() as u16)?;
        file.write_all(&raw)?;
        self.file = Some(file);
        Ok(())
    }

    /// Flushes and seals the writer. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}
