#[cfg(test)]
mod feedback_test;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use util::marshal::Marshal;

use crate::error::Result;
use crate::gateway::Gateway;
use crate::session::Session;

const REMB_INTERVAL: Duration = Duration::from_secs(5);

/// SSRCs are left at zero; the host rewrites them for the negotiated
/// stream before the packet goes out.
pub(crate) fn remb_packet(bitrate: u32) -> Result<Bytes> {
    let pkt = ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 0,
        bitrate: bitrate as f32,
        ssrcs: vec![0],
    };
    Ok(pkt.marshal()?)
}

pub(crate) fn pli_packet() -> Result<Bytes> {
    let pkt = PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc: 0,
    };
    Ok(pkt.marshal()?)
}

pub(crate) fn fir_packet(sequence_number: u8) -> Result<Bytes> {
    let pkt = FullIntraRequest {
        sender_ssrc: 0,
        media_ssrc: 0,
        fir: vec![FirEntry {
            ssrc: 0,
            sequence_number,
        }],
    };
    Ok(pkt.marshal()?)
}

/// Runs under the video ingest path of a capturing session.
///
/// Sends a REMB on each of the first four invocations, easing the sender up
/// to the configured bitrate, then one every five seconds at the full rate;
/// and a FIR plus a PLI every keyframe interval.
pub(crate) async fn process(session: &Session, gateway: &dyn Gateway) {
    let now = Instant::now();
    let mut fb = session.feedback.lock().await;

    let rampup = fb.remb_startup > 0;
    if rampup || now.duration_since(fb.remb_last) >= REMB_INTERVAL {
        let mut bitrate = fb.bitrate;
        if rampup {
            bitrate /= fb.remb_startup;
            fb.remb_startup -= 1;
        }
        match remb_packet(bitrate) {
            Ok(buf) => gateway.relay_rtcp(session.handle, true, &buf).await,
            Err(e) => log::warn!("couldn't build REMB: {e}"),
        }
        fb.remb_last = now;
    }

    let interval = Duration::from_millis(fb.keyframe_interval);
    let due = match fb.keyframe_last {
        None => true,
        Some(last) => now.duration_since(last) >= interval,
    };
    if due {
        log::info!("sending FIR and PLI to the capture peer");
        let seq = session.fir_seq.fetch_add(1, Ordering::SeqCst) as u8;
        match fir_packet(seq) {
            Ok(buf) => gateway.relay_rtcp(session.handle, true, &buf).await,
            Err(e) => log::warn!("couldn't build FIR: {e}"),
        }
        match pli_packet() {
            Ok(buf) => gateway.relay_rtcp(session.handle, true, &buf).await,
            Err(e) => log::warn!("couldn't build PLI: {e}"),
        }
        fb.keyframe_last = Some(now);
    }
}
