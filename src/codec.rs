use std::fmt;

/// Payload type offered to viewers when the codec doesn't mandate one.
pub const DEFAULT_AUDIO_PT: u8 = 111;
pub const DEFAULT_VIDEO_PT: u8 = 100;

/// Audio codecs a capture can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    Pcmu,
    Pcma,
    G722,
}

impl AudioCodec {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "opus" => Some(AudioCodec::Opus),
            "pcmu" => Some(AudioCodec::Pcmu),
            "pcma" => Some(AudioCodec::Pcma),
            "g722" => Some(AudioCodec::G722),
            _ => None,
        }
    }

    /// Lower-case tag used in the MJR info header and API replies.
    pub fn name(&self) -> &'static str {
        match self {
            AudioCodec::Opus => "opus",
            AudioCodec::Pcmu => "pcmu",
            AudioCodec::Pcma => "pcma",
            AudioCodec::G722 => "g722",
        }
    }

    /// Encoding name as it appears in an rtpmap attribute.
    pub fn rtpmap_name(&self) -> &'static str {
        match self {
            AudioCodec::Opus => "opus",
            AudioCodec::Pcmu => "PCMU",
            AudioCodec::Pcma => "PCMA",
            AudioCodec::G722 => "G722",
        }
    }

    /// Some audio codecs have a fixed payload type that we can't mess with.
    pub fn payload_type(&self) -> u8 {
        match self {
            AudioCodec::Pcmu => 0,
            AudioCodec::Pcma => 8,
            AudioCodec::G722 => 9,
            AudioCodec::Opus => DEFAULT_AUDIO_PT,
        }
    }

    /// RTP clock rate. G.722 is pinned at 8 kHz by RFC 3551.
    pub fn clock_rate(&self) -> u32 {
        match self {
            AudioCodec::Opus => 48000,
            AudioCodec::Pcmu | AudioCodec::Pcma | AudioCodec::G722 => 8000,
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            AudioCodec::Opus => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Video codecs a capture can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
}

impl VideoCodec {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "vp8" => Some(VideoCodec::Vp8),
            "vp9" => Some(VideoCodec::Vp9),
            "h264" => Some(VideoCodec::H264),
            _ => None,
        }
    }

    /// Lower-case tag used in the MJR info header and API replies.
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "vp8",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::H264 => "h264",
        }
    }

    /// Encoding name as it appears in an rtpmap attribute.
    pub fn rtpmap_name(&self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "VP8",
            VideoCodec::Vp9 => "VP9",
            VideoCodec::H264 => "H264",
        }
    }

    pub fn payload_type(&self) -> u8 {
        DEFAULT_VIDEO_PT
    }

    pub fn clock_rate(&self) -> u32 {
        90000
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Preference order used when picking a codec out of a client offer.
pub(crate) const AUDIO_PREFERENCES: [AudioCodec; 4] = [
    AudioCodec::Opus,
    AudioCodec::G722,
    AudioCodec::Pcmu,
    AudioCodec::Pcma,
];
pub(crate) const VIDEO_PREFERENCES: [VideoCodec; 3] =
    [VideoCodec::Vp8, VideoCodec::Vp9, VideoCodec::H264];
