use std::path::PathBuf;

/// Engine configuration, read once at init.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory captures are written to and scanned from. Created with mode
    /// 0755 if absent.
    pub path: PathBuf,
    /// Base URL of the live endpoint; each capture publishes to
    /// `<rtmp>/<id>`. None disables live publishing.
    pub rtmp: Option<String>,
    /// Whether to forward notifications to external event handlers.
    pub events: bool,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Config {
        Config {
            path: path.into(),
            rtmp: None,
            events: true,
        }
    }

    pub fn with_rtmp(mut self, rtmp: impl Into<String>) -> Config {
        self.rtmp = Some(rtmp.into());
        self
    }
}
