use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid record header")]
    ErrInvalidRecordHeader,
    #[error("truncated record")]
    ErrTruncatedRecord,
    #[error("missing info header")]
    ErrMissingInfoHeader,
    #[error("invalid info header: {0}")]
    ErrInvalidInfoHeader(String),
    #[error("unsupported media type in info header")]
    ErrUnsupportedMediaType,
    #[error("unknown codec {0}")]
    ErrUnknownCodec(String),

    #[error("recorder not writable")]
    ErrRecorderClosed,
    #[error("capture directory not usable: {0}")]
    ErrBadCaptureDir(String),
    #[error("no frames in capture")]
    ErrEmptyCapture,

    #[error("invalid descriptor: {0}")]
    ErrInvalidDescriptor(String),
    #[error("missing offer for capture {0}")]
    ErrMissingOffer(u64),
    #[error("live sink failed: {0}")]
    ErrSinkFailed(String),

    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Rtp(#[from] rtp::Error),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Sdp(#[from] sdp::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ErrInvalidInfoHeader(e.to_string())
    }
}
