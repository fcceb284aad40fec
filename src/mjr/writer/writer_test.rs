use std::path::PathBuf;

use super::*;
use crate::mjr::index::FrameIndex;
use crate::mjr::probe_codec;
use crate::codec::AudioCodec;

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("recplay-{tag}-{}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn rtp_packet(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0x80u8, pt & 0x7F];
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&ssrc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn test_writer_never_fed_leaves_no_file() -> Result<()> {
    let dir = temp_dir("writer-empty");
    let mut writer = MjrWriter::new(&dir, "opus", false, "silent");
    assert_eq!(writer.frames(), 0);
    writer.close()?;
    assert!(!dir.join("silent.mjr").exists());
    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn test_writer_index_round_trip() -> Result<()> {
    let dir = temp_dir("writer-roundtrip");
    let mut writer = MjrWriter::new(&dir, "opus", false, "take");

    let mut packets = vec![];
    for i in 0u16..50 {
        let payload = vec![i as u8; 40 + (i % 7) as usize];
        let pkt = rtp_packet(111, 100 + i, 1000 + i as u32 * 960, 0xDEAD_BEEF, &payload);
        writer.save_frame(&pkt)?;
        packets.push(pkt);
    }
    writer.close()?;
    assert_eq!(writer.frames(), 50);

    // The file identifies itself as an Opus audio capture.
    let probe = probe_codec(&dir, "take")?;
    assert_eq!(probe.audio_codec, Some(AudioCodec::Opus));

    // Every packet comes back byte-identical through the index.
    let index = FrameIndex::parse(&dir, "take")?;
    assert_eq!(index.len(), packets.len());
    let raw = std::fs::read(dir.join("take.mjr"))?;
    for (node, expected) in index.iter().zip(packets.iter()) {
        let start = node.offset as usize;
        let end = start + node.len as usize;
        assert_eq!(&raw[start..end], expected.as_slice());
    }

    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn test_writer_rejects_after_close() -> Result<()> {
    let dir = temp_dir("writer-closed");
    let mut writer = MjrWriter::new(&dir, "vp8", true, "done");
    writer.save_frame(&rtp_packet(100, 1, 1, 1, &[0u8; 20]))?;
    writer.close()?;
    assert_eq!(
        writer.save_frame(&rtp_packet(100, 2, 2, 1, &[0u8; 20])),
        Err(Error::ErrRecorderClosed)
    );
    // Closing twice is fine.
    writer.close()?;
    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}
