use rtp::header::Header;

use super::*;
use crate::codec::VideoCodec;

/// Minimal VP8 payload: one-byte descriptor, then the frame header byte.
/// `keyframe` drives the P bit.
fn vp8_payload(keyframe: bool) -> Vec<u8> {
    vec![0x10, if keyframe { 0x00 } else { 0x01 }, 0xAA, 0xBB]
}

fn header(ssrc: u32, seq: u16, ts: u32) -> Header {
    Header {
        version: 2,
        ssrc,
        sequence_number: seq,
        timestamp: ts,
        ..Default::default()
    }
}

#[test]
fn test_selector_keeps_only_target_substream() {
    let mut ctx = SimulcastContext::default();
    let mut ssrcs = [100u32, 200, 300];
    let rids: [Option<String>; 3] = [None, None, None];

    // No substream selected yet: everything without a keyframe is dropped
    // and a PLI is requested.
    assert!(!ctx.process(
        &header(100, 1, 1000),
        &vp8_payload(false),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert!(ctx.need_pli);

    // A keyframe on the target substream locks it in.
    assert!(ctx.process(
        &header(300, 50, 1000),
        &vp8_payload(true),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert_eq!(ctx.substream, 2);
    assert!(ctx.changed_substream);

    // Lower layers keep being dropped, the selected one passes.
    assert!(!ctx.process(
        &header(100, 2, 1500),
        &vp8_payload(false),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert!(!ctx.process(
        &header(200, 7, 1500),
        &vp8_payload(false),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert!(ctx.process(
        &header(300, 51, 1500),
        &vp8_payload(false),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert!(!ctx.changed_substream);

    // An unknown SSRC is not part of the negotiation at all.
    assert!(!ctx.process(
        &header(999, 1, 1500),
        &vp8_payload(true),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
}

#[test]
fn test_selector_switch_waits_for_keyframe() {
    let mut ctx = SimulcastContext {
        substream_target: 1,
        ..Default::default()
    };
    let mut ssrcs = [100u32, 200, 300];
    let rids: [Option<String>; 3] = [None, None, None];

    assert!(ctx.process(
        &header(200, 1, 1000),
        &vp8_payload(true),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert_eq!(ctx.substream, 1);

    // Raise the target: packets of substream 2 stay dropped, and we keep
    // asking for a keyframe, until one arrives.
    ctx.substream_target = 2;
    assert!(!ctx.process(
        &header(300, 10, 2000),
        &vp8_payload(false),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert!(ctx.need_pli);
    assert!(ctx.process(
        &header(300, 11, 3000),
        &vp8_payload(true),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert_eq!(ctx.substream, 2);
    assert!(ctx.changed_substream);
    assert!(!ctx.need_pli);
}

#[test]
fn test_selector_learns_ssrc_from_rid() {
    let mut ctx = SimulcastContext {
        rid_ext_id: Some(4),
        ..Default::default()
    };
    let mut ssrcs = [0u32; 3];
    let rids = [
        Some("q".to_owned()),
        Some("h".to_owned()),
        Some("f".to_owned()),
    ];

    let mut hdr = header(777, 1, 1000);
    hdr.set_extension(4, bytes::Bytes::from_static(b"f")).unwrap();
    assert!(ctx.process(&hdr, &vp8_payload(true), &mut ssrcs, &rids, VideoCodec::Vp8));
    assert_eq!(ssrcs[2], 777);
    assert_eq!(ctx.substream, 2);

    // From now on the SSRC alone identifies the substream.
    assert!(ctx.process(
        &header(777, 2, 1500),
        &vp8_payload(false),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
}

#[test]
fn test_selector_temporal_layer_filter() {
    let mut ctx = SimulcastContext {
        templayer_target: 0,
        ..Default::default()
    };
    let mut ssrcs = [100u32, 0, 0];
    let rids: [Option<String>; 3] = [None, None, None];
    ctx.substream_target = 0;

    // Descriptor with the T bit: X set, then tid in the top bits.
    let with_tid = |tid: u8, keyframe: bool| -> Vec<u8> {
        vec![
            0x90,
            0x20,
            tid << 6,
            if keyframe { 0x00 } else { 0x01 },
            0xAA,
        ]
    };

    assert!(ctx.process(
        &header(100, 1, 1000),
        &with_tid(0, true),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    // Higher temporal layers are filtered out.
    assert!(!ctx.process(
        &header(100, 2, 1500),
        &with_tid(2, false),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
    assert!(ctx.process(
        &header(100, 3, 2000),
        &with_tid(0, false),
        &mut ssrcs,
        &rids,
        VideoCodec::Vp8
    ));
}

#[test]
fn test_switching_context_continuity() {
    let mut ctx = SwitchingContext::default();

    assert_eq!(ctx.update(300, 10, 1000), (10, 1000));
    assert_eq!(ctx.update(300, 11, 4000), (11, 4000));

    // Substream switch: the output continues one step after the last packet
    // even though the new SSRC carries unrelated counters.
    let (seq, ts) = ctx.update(400, 500, 90_000);
    assert_eq!(seq, 12);
    assert_eq!(ts, 7000);

    let (seq, ts) = ctx.update(400, 501, 93_000);
    assert_eq!(seq, 13);
    assert_eq!(ts, 10_000);
}

#[test]
fn test_vp8_descriptor_rewrite() {
    // X + S, I flag, 15-bit picture id 1000, then the frame header.
    let make = |picture_id: u16, keyframe: bool| -> Vec<u8> {
        vec![
            0x90,
            0x80,
            0x80 | ((picture_id >> 8) & 0x7F) as u8,
            (picture_id & 0xFF) as u8,
            if keyframe { 0x00 } else { 0x01 },
            0xCC,
        ]
    };

    let mut ctx = vp8::Vp8SimulcastContext::default();
    let mut p1 = make(1000, true);
    ctx.update_descriptor(&mut p1, false);
    assert_eq!(p1, make(1000, true));

    let mut p2 = make(1001, false);
    ctx.update_descriptor(&mut p2, false);
    assert_eq!(p2, make(1001, false));

    // The new substream starts from an unrelated picture id; the rewritten
    // stream just keeps counting.
    let mut p3 = make(5, true);
    ctx.update_descriptor(&mut p3, true);
    assert_eq!(p3, make(1002, true));

    let mut p4 = make(6, false);
    ctx.update_descriptor(&mut p4, false);
    assert_eq!(p4, make(1003, false));
}

#[test]
fn test_vp8_keyframe_detection() {
    assert!(vp8::is_keyframe(&vp8_payload(true)));
    assert!(!vp8::is_keyframe(&vp8_payload(false)));
    // Continuation packets are never keyframes.
    assert!(!vp8::is_keyframe(&[0x00, 0x00, 0xAA]));
    assert!(!vp8::is_keyframe(&[]));
}
