use async_trait::async_trait;
use serde_json::Value;

/// Callbacks into the hosting WebRTC gateway.
///
/// The engine never touches signaling or transport itself: RTP/RTCP leave
/// through `relay_rtp`/`relay_rtcp`, API replies and SDP travel through
/// `push_event`, and `close_pc` asks the host to tear a peer connection
/// down. Handles are the opaque ids the host assigned at `create_session`.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Relays an RTP packet to the peer of `handle`.
    async fn relay_rtp(&self, handle: u64, video: bool, packet: &[u8]);

    /// Relays an RTCP packet to the peer of `handle`.
    async fn relay_rtcp(&self, handle: u64, video: bool, packet: &[u8]);

    /// Pushes an asynchronous event (and optionally a JSEP payload) to the
    /// client behind `handle`.
    async fn push_event(
        &self,
        handle: u64,
        transaction: Option<&str>,
        event: Value,
        jsep: Option<Value>,
    );

    /// Forwards an info object to external event handlers.
    async fn notify_event(&self, handle: u64, info: Value);

    /// Whether external event handlers are listening at all.
    fn events_enabled(&self) -> bool;

    /// Asks the host to close the peer connection of `handle`; the host
    /// answers with `hangup_media`.
    async fn close_pc(&self, handle: u64);
}
