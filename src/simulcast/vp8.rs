//! VP8 payload descriptor helpers for the simulcast selector.
//!
//! Picture id and tl0picidx are per-substream counters, so relaying a
//! substream switch without rewriting them confuses decoders. The context
//! here re-bases both so the output looks like one continuous encoding.

/// Parsed layout of a VP8 payload descriptor.
struct Descriptor {
    /// Start of partition.
    s: bool,
    /// Partition index.
    pid: u8,
    /// Offset of the (one or two byte) picture id field, if present.
    picture_id_at: Option<usize>,
    /// True when the picture id is the 16-bit form.
    picture_id_wide: bool,
    picture_id: u16,
    /// Offset of the tl0picidx byte, if present.
    tl0_at: Option<usize>,
    tl0: u8,
    /// Temporal layer index, if the T bit is set.
    tid: Option<u8>,
    /// Offset of the first payload octet after the descriptor.
    payload_at: usize,
}

fn parse(payload: &[u8]) -> Option<Descriptor> {
    if payload.len() < 2 {
        return None;
    }
    let b0 = payload[0];
    let x = b0 & 0x80 != 0;
    let s = b0 & 0x10 != 0;
    let pid = b0 & 0x07;
    let mut at = 1;

    let (mut i, mut l, mut t, mut k) = (false, false, false, false);
    if x {
        let b = *payload.get(at)?;
        i = b & 0x80 != 0;
        l = b & 0x40 != 0;
        t = b & 0x20 != 0;
        k = b & 0x10 != 0;
        at += 1;
    }

    let mut picture_id_at = None;
    let mut picture_id_wide = false;
    let mut picture_id = 0u16;
    if i {
        let b = *payload.get(at)?;
        picture_id_at = Some(at);
        if b & 0x80 != 0 {
            picture_id_wide = true;
            picture_id = (((b & 0x7F) as u16) << 8) | *payload.get(at + 1)? as u16;
            at += 2;
        } else {
            picture_id = b as u16;
            at += 1;
        }
    }

    let mut tl0_at = None;
    let mut tl0 = 0u8;
    if l {
        tl0 = *payload.get(at)?;
        tl0_at = Some(at);
        at += 1;
    }

    let mut tid = None;
    if t || k {
        let b = *payload.get(at)?;
        if t {
            tid = Some(b >> 6);
        }
        at += 1;
    }

    if at >= payload.len() {
        return None;
    }
    Some(Descriptor {
        s,
        pid,
        picture_id_at,
        picture_id_wide,
        picture_id,
        tl0_at,
        tl0,
        tid,
        payload_at: at,
    })
}

/// Whether this packet starts a keyframe: first packet of a partition and a
/// P bit of zero in the frame header.
pub fn is_keyframe(payload: &[u8]) -> bool {
    match parse(payload) {
        Some(d) => d.s && d.pid == 0 && payload[d.payload_at] & 0x01 == 0,
        None => false,
    }
}

/// Temporal layer index of this packet, when the descriptor carries one.
pub fn temporal_layer(payload: &[u8]) -> Option<u8> {
    parse(payload)?.tid
}

/// Re-bases picture id and tl0picidx across substream switches.
#[derive(Debug, Default, Clone)]
pub struct Vp8SimulcastContext {
    started: bool,
    base_picture_id: u16,
    base_picture_id_prev: u16,
    last_picture_id: u16,
    base_tl0: u8,
    base_tl0_prev: u8,
    last_tl0: u8,
}

impl Vp8SimulcastContext {
    pub fn reset(&mut self) {
        *self = Vp8SimulcastContext::default();
    }

    /// Rewrites the descriptor fields in place. `switched` must be true for
    /// the first packet after a substream change.
    pub fn update_descriptor(&mut self, payload: &mut [u8], switched: bool) {
        let d = match parse(payload) {
            Some(d) => d,
            None => return,
        };

        if !self.started {
            self.started = true;
            self.base_picture_id = d.picture_id;
            self.base_picture_id_prev = d.picture_id;
            self.base_tl0 = d.tl0;
            self.base_tl0_prev = d.tl0;
        } else if switched {
            self.base_picture_id = d.picture_id;
            self.base_picture_id_prev = (self.last_picture_id + 1) & 0x7FFF;
            self.base_tl0 = d.tl0;
            self.base_tl0_prev = self.last_tl0.wrapping_add(1);
        }

        let picture_id = self
            .base_picture_id_prev
            .wrapping_add(d.picture_id.wrapping_sub(self.base_picture_id))
            & 0x7FFF;
        let tl0 = self.base_tl0_prev.wrapping_add(d.tl0.wrapping_sub(self.base_tl0));
        self.last_picture_id = picture_id;
        self.last_tl0 = tl0;

        if let Some(at) = d.picture_id_at {
            if d.picture_id_wide {
                payload[at] = 0x80 | ((picture_id >> 8) & 0x7F) as u8;
                payload[at + 1] = (picture_id & 0xFF) as u8;
            } else {
                payload[at] = (picture_id & 0x7F) as u8;
            }
        }
        if let Some(at) = d.tl0_at {
            payload[at] = tl0;
        }
    }
}
