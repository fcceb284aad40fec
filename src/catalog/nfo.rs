//! The `.nfo` descriptor: one INI section per capture, mapping an id to its
//! metadata and to the audio/video files, e.g.
//!
//! ```text
//! [12345678]
//! name = My capture
//! date = 2024-10-14 17:11:26
//! audio = rec-12345678-audio.mjr
//! video = rec-12345678-video.mjr
//! ```

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfoDescriptor {
    pub id: u64,
    pub name: String,
    pub date: String,
    pub audio: Option<String>,
    pub video: Option<String>,
}

impl NfoDescriptor {
    /// Parses the descriptor; a missing section, `name` or `date`, or a
    /// descriptor naming no media at all, invalidates the file.
    pub fn parse(content: &str) -> Result<NfoDescriptor> {
        let mut id = None;
        let mut name = None;
        let mut date = None;
        let mut audio = None;
        let mut video = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if id.is_some() {
                    // A second section means this isn't one of ours.
                    break;
                }
                id = Some(
                    section
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| Error::ErrInvalidDescriptor("invalid id".to_owned()))?,
                );
                continue;
            }
            if id.is_none() {
                return Err(Error::ErrInvalidDescriptor("missing section".to_owned()));
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::ErrInvalidDescriptor(format!("bad line '{line}'")))?;
            let value = value.trim().to_owned();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "name" => name = Some(value),
                "date" => date = Some(value),
                "audio" => audio = Some(value),
                "video" => video = Some(value),
                _ => {}
            }
        }

        let id = id.ok_or_else(|| Error::ErrInvalidDescriptor("missing section".to_owned()))?;
        if id == 0 {
            return Err(Error::ErrInvalidDescriptor("invalid id".to_owned()));
        }
        let name = name.ok_or_else(|| Error::ErrInvalidDescriptor("missing name".to_owned()))?;
        let date = date.ok_or_else(|| Error::ErrInvalidDescriptor("missing date".to_owned()))?;
        if audio.is_none() && video.is_none() {
            return Err(Error::ErrInvalidDescriptor("no audio and no video".to_owned()));
        }
        Ok(NfoDescriptor {
            id,
            name,
            date,
            audio,
            video,
        })
    }

    /// Renders the descriptor with the `\r\n` line endings the format uses.
    pub fn render(&self) -> String {
        let mut out = format!(
            "[{}]\r\nname = {}\r\ndate = {}\r\n",
            self.id, self.name, self.date
        );
        if let Some(audio) = &self.audio {
            out.push_str(&format!("audio = {audio}\r\n"));
        }
        if let Some(video) = &self.video {
            out.push_str(&format!("video = {video}\r\n"));
        }
        out
    }
}
