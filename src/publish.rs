use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::{AudioCodec, VideoCodec};
use crate::error::Result;

/// A live publish destination for a capture, typically an RTMP muxer.
///
/// The sink receives every captured RTP frame in arrival order, tagged with
/// its medium and substream slot. It is opaque to the engine: muxing and
/// transcoding happen on the other side of this trait, and a failing sink
/// never takes the on-disk capture down with it.
#[async_trait]
pub trait LiveSink: Send + Sync {
    async fn push(&self, frame: &[u8], video: bool, slot: i32) -> Result<()>;

    /// Best-effort teardown.
    async fn close(&self);
}

/// Opens live sinks. The engine asks for one per capture, with the
/// per-capture URL already formed.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(
        &self,
        url: &str,
        audio: Option<AudioCodec>,
        video: Option<VideoCodec>,
    ) -> Result<Arc<dyn LiveSink>>;
}

/// Sink that discards everything, for hosts without a live endpoint.
#[derive(Default)]
pub struct NoopSink;

#[async_trait]
impl LiveSink for NoopSink {
    async fn push(&self, _frame: &[u8], _video: bool, _slot: i32) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct NoopSinkFactory;

#[async_trait]
impl SinkFactory for NoopSinkFactory {
    async fn open(
        &self,
        url: &str,
        _audio: Option<AudioCodec>,
        _video: Option<VideoCodec>,
    ) -> Result<Arc<dyn LiveSink>> {
        log::debug!("live publishing disabled, dropping frames for {url}");
        Ok(Arc::new(NoopSink))
    }
}
