use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use serde_json::Value;
use util::marshal::Unmarshal;

use super::*;
use crate::gateway::Gateway;
use crate::session::Session;

#[derive(Default)]
struct RtcpCollector {
    packets: StdMutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Gateway for RtcpCollector {
    async fn relay_rtp(&self, _handle: u64, _video: bool, _packet: &[u8]) {}

    async fn relay_rtcp(&self, _handle: u64, _video: bool, packet: &[u8]) {
        self.packets.lock().unwrap().push(packet.to_vec());
    }

    async fn push_event(
        &self,
        _handle: u64,
        _transaction: Option<&str>,
        _event: Value,
        _jsep: Option<Value>,
    ) {
    }

    async fn notify_event(&self, _handle: u64, _info: Value) {}

    fn events_enabled(&self) -> bool {
        false
    }

    async fn close_pc(&self, _handle: u64) {}
}

/// Payload-specific feedback format, from the packet header.
fn fmt_of(packet: &[u8]) -> (u8, u8) {
    (packet[0] & 0x1F, packet[1])
}

fn rembs(packets: &[Vec<u8>]) -> Vec<f32> {
    packets
        .iter()
        .filter(|p| fmt_of(p) == (15, 206))
        .map(|p| {
            ReceiverEstimatedMaximumBitrate::unmarshal(&mut &p[..])
                .unwrap()
                .bitrate
        })
        .collect()
}

#[tokio::test]
async fn test_remb_rampup_then_steady() {
    let gateway = RtcpCollector::default();
    let session = Arc::new(Session::new(1));
    let bitrate = 1_000_000u32;
    session.feedback.lock().await.bitrate = bitrate;

    // One invocation per incoming video packet.
    for _ in 0..6 {
        process(&session, &gateway).await;
    }

    let packets = gateway.packets.lock().unwrap();
    let rembs = rembs(&packets);
    // Four ramp-up REMBs, then silence until five seconds have passed.
    assert_eq!(rembs.len(), 4);
    let expected = [
        bitrate as f32 / 4.0,
        bitrate as f32 / 3.0,
        bitrate as f32 / 2.0,
        bitrate as f32,
    ];
    for (got, want) in rembs.iter().zip(expected.iter()) {
        // The REMB mantissa/exponent encoding rounds a little.
        assert!((got - want).abs() / want < 0.001, "got {got}, want {want}");
    }
}

#[tokio::test]
async fn test_remb_steady_state_interval() {
    let gateway = RtcpCollector::default();
    let session = Arc::new(Session::new(1));
    {
        let mut fb = session.feedback.lock().await;
        fb.remb_startup = 0;
        fb.remb_last = Instant::now();
    }
    for _ in 0..3 {
        process(&session, &gateway).await;
    }
    // Not five seconds yet: no REMB at all.
    assert_eq!(rembs(&gateway.packets.lock().unwrap()).len(), 0);

    // Pretend the last REMB is stale.
    session.feedback.lock().await.remb_last = Instant::now() - Duration::from_secs(6);
    process(&session, &gateway).await;
    assert_eq!(rembs(&gateway.packets.lock().unwrap()).len(), 1);
}

#[tokio::test]
async fn test_keyframe_requests_fir_and_pli() {
    let gateway = RtcpCollector::default();
    let session = Arc::new(Session::new(1));

    process(&session, &gateway).await;
    {
        let packets = gateway.packets.lock().unwrap();
        // FIR and PLI ride along with the first feedback round.
        assert!(packets.iter().any(|p| fmt_of(p) == (4, 206)));
        assert!(packets.iter().any(|p| fmt_of(p) == (1, 206)));
    }

    // Within the interval nothing more is requested.
    process(&session, &gateway).await;
    let packets = gateway.packets.lock().unwrap();
    assert_eq!(packets.iter().filter(|p| fmt_of(p) == (4, 206)).count(), 1);
    drop(packets);

    // Force the interval to elapse: a new FIR with a bumped sequence.
    session.feedback.lock().await.keyframe_last =
        Some(Instant::now() - Duration::from_secs(20));
    process(&session, &gateway).await;
    let packets = gateway.packets.lock().unwrap();
    let firs: Vec<u8> = packets
        .iter()
        .filter(|p| fmt_of(p) == (4, 206))
        .map(|p| {
            FullIntraRequest::unmarshal(&mut &p[..]).unwrap().fir[0].sequence_number
        })
        .collect();
    assert_eq!(firs, vec![0, 1]);
}
