
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::catalog::CaptureEntry;
use crate::gateway::Gateway;
use crate::mjr;
use crate::mjr::index::FrameIndex;
use crate::session::{ReplayFrames, Session};

/// How far ahead of schedule a packet may leave, and how long an idle round
/// sleeps.
const PACING_SLACK: Duration = Duration::from_millis(5);

/// One medium being walked: its ordered index, the open capture file, the
/// replay payload type and the RTP clock in kHz.
struct MediumPlayback {
    index: FrameIndex,
    file: File,
    pt: u8,
    khz: u64,
    cursor: Option<usize>,
    /// Timestamp of the last emitted packet; None until the first send.
    prev_ts: Option<u64>,
    before: Instant,
}

impl MediumPlayback {
    fn open(dir: &Path, name: &str, index: FrameIndex, pt: u8, khz: u64) -> std::io::Result<Self> {
        let file = File::open(mjr::media_path(dir, name))?;
        Ok(MediumPlayback {
            cursor: index.first(),
            index,
            file,
            pt,
            khz,
            prev_ts: None,
            before: Instant::now(),
        })
    }

    fn exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    /// Reads the packet at `at` and stamps the replay payload type on it.
    fn read_packet(&mut self, at: usize) -> std::io::Result<Vec<u8>> {
        let pkt = *self.index.get(at);
        let mut buf = vec![0u8; pkt.len as usize];
        self.file.seek(SeekFrom::Start(pkt.offset))?;
        self.file.read_exact(&mut buf)?;
        if buf.len() >= 2 {
            buf[1] = (buf[1] & 0x80) | (self.pt & 0x7F);
        }
        Ok(buf)
    }
}

/// Replays a capture over the session's peer connection at its original
/// cadence. One task per replaying session, launched when media comes up.
///
/// Each medium paces independently: the first packet goes out immediately,
/// every later one waits until the wall clock has covered the RTP timestamp
/// gap to its predecessor (minus a small slack). Video packets sharing a
/// timestamp travel together. When neither medium had anything to send the
/// task naps instead of spinning.
pub(crate) async fn playout_task(
    gateway: Arc<dyn Gateway>,
    dir: std::path::PathBuf,
    session: Arc<Session>,
    entry: Arc<CaptureEntry>,
) {
    log::info!("joining playout task for capture {}", entry.id);

    let ReplayFrames { audio, video } = std::mem::take(&mut *session.frames.lock().await);
    let media = entry.media.lock().await.clone();

    let akhz = match media.audio_pt {
        0 | 8 | 9 => 8,
        _ => 48,
    };

    let mut audio = match (audio, &media.audio_file) {
        (Some(index), Some(name)) => {
            match MediumPlayback::open(&dir, name, index, media.audio_pt, akhz) {
                Ok(m) => Some(m),
                Err(e) => {
                    log::error!("could not open audio capture: {e}");
                    None
                }
            }
        }
        _ => None,
    };
    let mut video = match (video, &media.video_file) {
        (Some(index), Some(name)) => {
            match MediumPlayback::open(&dir, name, index, media.video_pt, 90) {
                Ok(m) => Some(m),
                Err(e) => {
                    log::error!("could not open video capture: {e}");
                    None
                }
            }
        }
        _ => None,
    };
    if audio.is_none() && video.is_none() {
        log::error!("no audio and no video frames, bailing out of playout");
        entry.remove_viewer(session.handle).await;
        gateway.close_pc(session.handle).await;
        return;
    }

    let mut asent = false;
    let mut vsent = false;
    while !session.destroyed()
        && session.is_active()
        && !entry.destroyed()
        && (audio.as_ref().map(|m| !m.exhausted()).unwrap_or(false)
            || video.as_ref().map(|m| !m.exhausted()).unwrap_or(false))
    {
        if !asent && !vsent {
            // Skipped the last round, don't busy-loop.
            sleep(PACING_SLACK).await;
        }
        asent = false;
        vsent = false;

        if let Some(m) = &mut audio {
            if let Some(at) = m.cursor {
                let pkt = *m.index.get(at);
                let send = match m.prev_ts {
                    // First packet, send right away.
                    None => {
                        m.before = Instant::now();
                        true
                    }
                    Some(prev) => {
                        let gap =
                            Duration::from_micros(pkt.ts.saturating_sub(prev) * 1000 / m.khz);
                        if m.before.elapsed() + PACING_SLACK >= gap {
                            m.before += gap;
                            true
                        } else {
                            false
                        }
                    }
                };
                if send {
                    match m.read_packet(at) {
                        Ok(buf) => gateway.relay_rtp(session.handle, false, &buf).await,
                        Err(e) => log::warn!("couldn't read audio packet: {e}"),
                    }
                    m.prev_ts = Some(pkt.ts);
                    m.cursor = m.index.next(at);
                    asent = true;
                }
            }
        }

        if let Some(m) = &mut video {
            if let Some(at) = m.cursor {
                let pkt = *m.index.get(at);
                let send = match m.prev_ts {
                    None => {
                        m.before = Instant::now();
                        true
                    }
                    Some(prev) => {
                        let gap =
                            Duration::from_micros(pkt.ts.saturating_sub(prev) * 1000 / m.khz);
                        if m.before.elapsed() + PACING_SLACK >= gap {
                            m.before += gap;
                            true
                        } else {
                            false
                        }
                    }
                };
                if send {
                    // A fragmented frame shares one timestamp; send it whole.
                    let ts = pkt.ts;
                    let mut cursor = Some(at);
                    while let Some(at) = cursor {
                        if m.index.get(at).ts != ts {
                            break;
                        }
                        match m.read_packet(at) {
                            Ok(buf) => gateway.relay_rtp(session.handle, true, &buf).await,
                            Err(e) => log::warn!("couldn't read video packet: {e}"),
                        }
                        cursor = m.index.next(at);
                    }
                    m.prev_ts = Some(ts);
                    m.cursor = cursor;
                    vsent = true;
                }
            }
        }
    }

    drop(audio);
    drop(video);

    // Leave the audience and let the host tear the peer connection down.
    entry.remove_viewer(session.handle).await;
    gateway.close_pc(session.handle).await;

    log::info!("leaving playout task for capture {}", entry.id);
}
