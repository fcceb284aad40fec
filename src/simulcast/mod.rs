#[cfg(test)]
mod simulcast_test;

pub mod vp8;

use rtp::header::Header;

use crate::codec::VideoCodec;

/// Rewrites sequence numbers and timestamps so the stream a viewer (or a
/// capture file) sees stays continuous across substream switches.
#[derive(Debug, Default, Clone)]
pub struct SwitchingContext {
    started: bool,
    last_ssrc: u32,
    base_ts: u32,
    base_ts_prev: u32,
    base_seq: u16,
    base_seq_prev: u16,
    last_out_ts: u32,
    last_out_seq: u16,
    ts_step: u32,
}

/// Nominal 90 kHz timestamp step used for the first switch, before a real
/// inter-frame gap has been observed.
const DEFAULT_VIDEO_TS_STEP: u32 = 2880;

impl SwitchingContext {
    pub fn reset(&mut self) {
        *self = SwitchingContext::default();
    }

    /// Maps a packet's sequence number and timestamp into the output stream.
    /// An SSRC change re-bases the mapping so the output picks up right after
    /// the last emitted packet.
    pub fn update(&mut self, ssrc: u32, seq: u16, ts: u32) -> (u16, u32) {
        if !self.started {
            self.started = true;
            self.last_ssrc = ssrc;
            self.base_ts = ts;
            self.base_ts_prev = ts;
            self.base_seq = seq;
            self.base_seq_prev = seq;
            self.ts_step = DEFAULT_VIDEO_TS_STEP;
            self.last_out_ts = ts;
            self.last_out_seq = seq;
            return (seq, ts);
        }
        if ssrc != self.last_ssrc {
            log::debug!("SSRC changed {:x} -> {:x}, re-basing", self.last_ssrc, ssrc);
            self.last_ssrc = ssrc;
            self.base_ts = ts;
            self.base_ts_prev = self.last_out_ts.wrapping_add(self.ts_step);
            self.base_seq = seq;
            self.base_seq_prev = self.last_out_seq.wrapping_add(1);
        }

        let out_ts = self.base_ts_prev.wrapping_add(ts.wrapping_sub(self.base_ts));
        let out_seq = self.base_seq_prev.wrapping_add(seq.wrapping_sub(self.base_seq));

        let delta = out_ts.wrapping_sub(self.last_out_ts);
        if delta != 0 && delta < u32::MAX / 2 {
            self.ts_step = delta;
        }
        self.last_out_ts = out_ts;
        self.last_out_seq = out_seq;
        (out_seq, out_ts)
    }
}

/// Per-packet simulcast layer selection.
///
/// A packet is attributed to a substream by SSRC, or by the rid header
/// extension when the SSRCs haven't been learned yet. Substream switches are
/// gated on a keyframe; `need_pli` latches when a switch is pending so the
/// caller can ask the sender for one.
#[derive(Debug, Clone)]
pub struct SimulcastContext {
    pub rid_ext_id: Option<u8>,
    pub substream: i8,
    pub substream_target: u8,
    pub templayer: i8,
    pub templayer_target: u8,
    pub changed_substream: bool,
    pub changed_temporal: bool,
    pub need_pli: bool,
}

impl Default for SimulcastContext {
    fn default() -> Self {
        SimulcastContext {
            rid_ext_id: None,
            substream: -1,
            // Aim for the highest quality and all temporal layers.
            substream_target: 2,
            templayer: -1,
            templayer_target: 2,
            changed_substream: false,
            changed_temporal: false,
            need_pli: false,
        }
    }
}

impl SimulcastContext {
    pub fn reset(&mut self) {
        *self = SimulcastContext::default();
    }

    /// Decides whether this packet belongs to the selected layer. Returns
    /// false when the packet must be dropped. `ssrcs` is updated in place
    /// when a rid-identified substream reveals its SSRC.
    pub fn process(
        &mut self,
        header: &Header,
        payload: &[u8],
        ssrcs: &mut [u32; 3],
        rids: &[Option<String>; 3],
        codec: VideoCodec,
    ) -> bool {
        self.changed_substream = false;
        self.changed_temporal = false;

        let mut layer = ssrcs
            .iter()
            .position(|&s| s != 0 && s == header.ssrc)
            .map(|l| l as i8);
        if layer.is_none() {
            if let Some(ext_id) = self.rid_ext_id {
                if let Some(raw) = header.get_extension(ext_id) {
                    if let Ok(rid) = std::str::from_utf8(&raw) {
                        if let Some(l) = rids.iter().position(|r| r.as_deref() == Some(rid)) {
                            log::debug!("learned SSRC {:x} for rid {rid}", header.ssrc);
                            ssrcs[l] = header.ssrc;
                            layer = Some(l as i8);
                        }
                    }
                }
            }
        }
        let layer = match layer {
            Some(l) => l,
            // Not one of the negotiated substreams.
            None => return false,
        };

        let keyframe = match codec {
            VideoCodec::Vp8 => vp8::is_keyframe(payload),
            VideoCodec::H264 => h264_is_keyframe(payload),
            VideoCodec::Vp9 => false,
        };
        let target = self.substream_target.min(2) as i8;

        if self.substream == -1 {
            // Nothing selected yet: hold out for a keyframe on the target.
            if layer == target && keyframe {
                self.substream = layer;
                self.changed_substream = true;
                log::debug!("starting on substream {layer}");
            } else {
                self.need_pli = true;
                return false;
            }
        } else if layer != self.substream {
            if layer == target && keyframe {
                log::debug!("switching substream {} -> {layer}", self.substream);
                self.substream = layer;
                self.changed_substream = true;
                self.need_pli = false;
            } else {
                if layer == target {
                    // We want this substream, waiting on a keyframe.
                    self.need_pli = true;
                }
                return false;
            }
        }

        // Temporal-layer filtering, VP8 only.
        if codec == VideoCodec::Vp8 {
            if let Some(tid) = vp8::temporal_layer(payload) {
                if tid as i8 > self.templayer_target as i8 {
                    if self.templayer != self.templayer_target as i8 {
                        self.templayer = self.templayer_target as i8;
                        self.changed_temporal = true;
                    }
                    return false;
                }
                if tid as i8 != self.templayer {
                    self.templayer = tid as i8;
                }
            }
        }

        true
    }
}

/// A keyframe for our purposes is any packet carrying an IDR or SPS NAL.
fn h264_is_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let nal_type = payload[0] & 0x1F;
    match nal_type {
        5 | 7 => true,
        // STAP-A: scan the aggregated units.
        24 => {
            let mut at = 1;
            while at + 2 < payload.len() {
                let size = ((payload[at] as usize) << 8) | payload[at + 1] as usize;
                let t = payload[at + 2] & 0x1F;
                if t == 5 || t == 7 {
                    return true;
                }
                at += 2 + size;
            }
            false
        }
        // FU-A: the start fragment names the real type.
        28 => {
            if payload.len() < 2 {
                return false;
            }
            let start = payload[1] & 0x80 != 0;
            start && payload[1] & 0x1F == 5
        }
        _ => false,
    }
}
