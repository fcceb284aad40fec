
pub mod index;
pub mod writer;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::codec::{AudioCodec, VideoCodec};
use crate::error::{Error, Result};

/// Tag of the leading info record in a new-format file.
pub const INFO_TAG: &[u8; 8] = b"MJR00002";
/// Tag of every frame record (and of everything in the old format).
pub const FRAME_TAG: &[u8; 8] = b"MEETECHO";

/// Length of the old-format `audio`/`video` marker payload.
pub(crate) const OLD_HEADER_LEN: u16 = 5;
/// Records shorter than a bare RTP header are skipped as non-RTP.
pub(crate) const MIN_RTP_LEN: u16 = 12;

/// JSON info object stored in the first record of a new-format file.
///
/// `t` is `"a"` or `"v"`, `c` the codec tag, `s` the creation time and `u`
/// the time the first frame was written, both in microseconds since the
/// epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoHeader {
    pub t: String,
    pub c: String,
    #[serde(default)]
    pub s: i64,
    #[serde(default)]
    pub u: i64,
}

impl InfoHeader {
    pub fn is_video(&self) -> Result<bool> {
        match self.t.as_str() {
            "v" => Ok(true),
            "a" => Ok(false),
            _ => Err(Error::ErrUnsupportedMediaType),
        }
    }
}

/// What kind of record a tag announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordTag {
    /// Old-format record, or a frame record in the new format.
    Frame,
    /// New-format info record.
    Info,
}

impl RecordTag {
    pub(crate) fn parse(tag: &[u8; 8]) -> Result<RecordTag> {
        if tag[0] != b'M' {
            return Err(Error::ErrInvalidRecordHeader);
        }
        match tag[1] {
            b'E' => Ok(RecordTag::Frame),
            b'J' => Ok(RecordTag::Info),
            _ => Err(Error::ErrInvalidRecordHeader),
        }
    }
}

/// Reads one record preamble: the 8-byte tag and the 2-byte length.
///
/// Returns `Ok(None)` at a clean end of file; a short read anywhere else is
/// a parse error.
pub(crate) fn read_record_preamble(file: &mut File) -> Result<Option<(RecordTag, u16)>> {
    let mut tag = [0u8; 8];
    match file.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let tag = RecordTag::parse(&tag)?;
    let len = file
        .read_u16::<BigEndian>()
        .map_err(|_| Error::ErrTruncatedRecord)?;
    Ok(Some((tag, len)))
}

/// Resolves a logical capture name to its on-disk path, appending `.mjr`
/// unless the name already carries it.
pub fn media_path(dir: &Path, name: &str) -> PathBuf {
    if name.ends_with(".mjr") {
        dir.join(name)
    } else {
        dir.join(format!("{name}.mjr"))
    }
}

/// Codec information recovered from a capture file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecProbe {
    pub video: bool,
    pub audio_codec: Option<AudioCodec>,
    pub video_codec: Option<VideoCodec>,
    /// Old-format file: the codec is assumed, not recorded.
    pub degraded: bool,
}

/// Opens a capture and reads just enough of it to learn which codec it
/// carries. Old-format files are assumed to be Opus or VP8.
pub fn probe_codec(dir: &Path, name: &str) -> Result<CodecProbe> {
    let path = media_path(dir, name);
    let mut file = File::open(&path)?;

    let (tag, len) = read_record_preamble(&mut file)?.ok_or(Error::ErrMissingInfoHeader)?;
    match tag {
        RecordTag::Frame => {
            // Old format: a 5-byte marker naming the medium, no codec field.
            if len != OLD_HEADER_LEN {
                return Err(Error::ErrMissingInfoHeader);
            }
            let mut marker = [0u8; OLD_HEADER_LEN as usize];
            file.read_exact(&mut marker)
                .map_err(|_| Error::ErrTruncatedRecord)?;
            match marker[0] {
                b'v' => {
                    log::info!("old video capture {}, assuming VP8", path.display());
                    Ok(CodecProbe {
                        video: true,
                        audio_codec: None,
                        video_codec: Some(VideoCodec::Vp8),
                        degraded: true,
                    })
                }
                b'a' => {
                    log::info!("old audio capture {}, assuming Opus", path.display());
                    Ok(CodecProbe {
                        video: false,
                        audio_codec: Some(AudioCodec::Opus),
                        video_codec: None,
                        degraded: true,
                    })
                }
                _ => Err(Error::ErrUnsupportedMediaType),
            }
        }
        RecordTag::Info => {
            let mut raw = vec![0u8; len as usize];
            file.read_exact(&mut raw)
                .map_err(|_| Error::ErrTruncatedRecord)?;
            let info: InfoHeader = serde_json::from_slice(&raw)?;
            let video = info.is_video()?;
            if video {
                let codec = VideoCodec::from_name(&info.c)
                    .ok_or_else(|| Error::ErrUnknownCodec(info.c.clone()))?;
                Ok(CodecProbe {
                    video: true,
                    audio_codec: None,
                    video_codec: Some(codec),
                    degraded: false,
                })
            } else {
                let codec = AudioCodec::from_name(&info.c)
                    .ok_or_else(|| Error::ErrUnknownCodec(info.c.clone()))?;
                Ok(CodecProbe {
                    video: false,
                    audio_codec: Some(codec),
                    video_codec: None,
                    degraded: false,
                })
            }
        }
    }
}
