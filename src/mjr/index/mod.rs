
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

use super::{media_path, read_record_preamble, InfoHeader, RecordTag, MIN_RTP_LEN, OLD_HEADER_LEN};
use crate::error::{Error, Result};

/// Timestamps anchor: packets above this far below the last seen timestamp
/// are a wrap/reset rather than reordering.
const RESET_THRESHOLD: u32 = 2_000_000_000;
/// Sequence numbers further apart than this at an equal timestamp wrapped.
const SEQ_WRAP_DISTANCE: i32 = 10_000;

/// One RTP packet of a capture, located by its byte range in the file.
#[derive(Debug, Clone, Copy)]
pub struct FramePacket {
    /// RTP sequence number.
    pub seq: u16,
    /// Wrap-extended RTP timestamp.
    pub ts: u64,
    /// Length of the packet on disk.
    pub len: u16,
    /// Offset of the packet in the file.
    pub offset: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Timestamp-ordered index over one capture file.
///
/// Nodes live in an arena and are chained both ways, so insertion can walk
/// backward from the tail in O(1) per step; captures are nearly sorted, which
/// makes that walk short.
#[derive(Debug, Default)]
pub struct FrameIndex {
    nodes: Vec<FramePacket>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl FrameIndex {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn first(&self) -> Option<usize> {
        self.head
    }

    pub fn get(&self, at: usize) -> &FramePacket {
        &self.nodes[at]
    }

    pub fn next(&self, at: usize) -> Option<usize> {
        self.nodes[at].next
    }

    pub fn iter(&self) -> FrameIter<'_> {
        FrameIter {
            index: self,
            at: self.head,
        }
    }

    /// Inserts a packet, walking backward from the tail. Ordered by extended
    /// timestamp first, then by sequence number with wrap awareness: two
    /// sequence numbers more than `SEQ_WRAP_DISTANCE` apart compare through
    /// the wrap, so the numerically smaller one is the later packet.
    fn insert(&mut self, mut pkt: FramePacket) {
        pkt.prev = None;
        pkt.next = None;
        let at = self.nodes.len();

        let mut cursor = self.tail;
        while let Some(cur) = cursor {
            let node = self.nodes[cur];
            let after = if node.ts < pkt.ts {
                true
            } else if node.ts == pkt.ts {
                let dist = (node.seq as i32 - pkt.seq as i32).abs();
                (node.seq < pkt.seq && dist < SEQ_WRAP_DISTANCE)
                    || (node.seq > pkt.seq && dist > SEQ_WRAP_DISTANCE)
            } else {
                false
            };
            if after {
                pkt.prev = Some(cur);
                pkt.next = self.nodes[cur].next;
                match self.nodes[cur].next {
                    Some(nxt) => self.nodes[nxt].prev = Some(at),
                    None => self.tail = Some(at),
                }
                self.nodes[cur].next = Some(at);
                self.nodes.push(pkt);
                return;
            }
            cursor = node.prev;
        }

        // Reached the start: the packet becomes the new head.
        pkt.next = self.head;
        if let Some(head) = self.head {
            self.nodes[head].prev = Some(at);
        } else {
            self.tail = Some(at);
        }
        self.head = Some(at);
        self.nodes.push(pkt);
    }

    /// Pre-parses a capture file into an ordered index.
    pub fn parse(dir: &Path, name: &str) -> Result<FrameIndex> {
        let path = media_path(dir, name);
        let mut file = File::open(&path)?;
        let fsize = file.metadata()?.len();
        log::debug!("pre-parsing {} ({fsize} bytes)", path.display());

        // First pass: find timestamp resets.
        let mut parsed_header = false;
        let mut first_ts: u32 = 0;
        let mut last_ts: u32 = 0;
        let mut have_last = false;
        let mut reset: u32 = 0;

        loop {
            let (tag, len) = match read_record_preamble(&mut file)? {
                Some(v) => v,
                None => break,
            };
            match tag {
                RecordTag::Frame => {
                    if len == OLD_HEADER_LEN && !parsed_header {
                        // Old-format media marker.
                        let mut marker = [0u8; OLD_HEADER_LEN as usize];
                        file.read_exact(&mut marker)
                            .map_err(|_| Error::ErrTruncatedRecord)?;
                        match marker[0] {
                            b'a' | b'v' => parsed_header = true,
                            _ => return Err(Error::ErrUnsupportedMediaType),
                        }
                        continue;
                    } else if len < MIN_RTP_LEN {
                        // Not RTP, skip.
                        file.seek(SeekFrom::Current(len as i64))?;
                        continue;
                    }
                }
                RecordTag::Info => {
                    if len > 0 && !parsed_header {
                        let mut raw = vec![0u8; len as usize];
                        file.read_exact(&mut raw)
                            .map_err(|_| Error::ErrTruncatedRecord)?;
                        let info: InfoHeader = serde_json::from_slice(&raw)?;
                        let video = info.is_video()?;
                        if info.c.is_empty() {
                            return Err(Error::ErrInvalidInfoHeader("missing codec".to_owned()));
                        }
                        parsed_header = true;
                        log::debug!(
                            "{} capture, codec {}, created {}, first write {}",
                            if video { "video" } else { "audio" },
                            info.c,
                            info.s,
                            info.u,
                        );
                        continue;
                    }
                    file.seek(SeekFrom::Current(len as i64))?;
                    continue;
                }
            }

            // Only look at the RTP header.
            let mut rtp = [0u8; 16];
            file.read_exact(&mut rtp)
                .map_err(|_| Error::ErrTruncatedRecord)?;
            let ts = BigEndian::read_u32(&rtp[4..8]);
            if !have_last {
                first_ts = ts;
                // Leave room below the anchor to tell pre- from post-reset.
                if first_ts > 1_000_000 {
                    first_ts -= 1_000_000;
                }
            } else if ts < last_ts && last_ts - ts > RESET_THRESHOLD {
                log::debug!("timestamp reset at {ts}");
                reset = ts;
            } else if reset > 0 && ts < reset {
                log::debug!("updating timestamp reset to {ts} (was {reset})");
                reset = ts;
            }
            last_ts = ts;
            have_last = true;
            file.seek(SeekFrom::Current(len as i64 - 16))?;
        }

        // Second pass: build the ordered list.
        file.seek(SeekFrom::Start(0))?;
        let mut index = FrameIndex::default();
        loop {
            let offset = file.stream_position()?;
            let (tag, len) = match read_record_preamble(&mut file)? {
                Some(v) => v,
                None => break,
            };
            let data_offset = offset + 10;
            if tag == RecordTag::Info || len < MIN_RTP_LEN {
                file.seek(SeekFrom::Current(len as i64))?;
                continue;
            }
            let mut rtp = [0u8; 16];
            if file.read_exact(&mut rtp).is_err() {
                log::warn!("error reading RTP header, stopping here");
                break;
            }
            let seq = BigEndian::read_u16(&rtp[2..4]);
            let raw_ts = BigEndian::read_u32(&rtp[4..8]);
            let ts = if reset == 0 || raw_ts > first_ts {
                raw_ts as u64
            } else {
                // Post-reset: continue past the 32-bit wrap.
                (1u64 << 32) + raw_ts as u64
            };
            index.insert(FramePacket {
                seq,
                ts,
                len,
                offset: data_offset,
                prev: None,
                next: None,
            });
            file.seek(SeekFrom::Current(len as i64 - 16))?;
        }

        log::debug!("indexed {} RTP packets", index.len());
        Ok(index)
    }
}

pub struct FrameIter<'a> {
    index: &'a FrameIndex,
    at: Option<usize>,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = &'a FramePacket;

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.at?;
        self.at = self.index.nodes[at].next;
        Some(&self.index.nodes[at])
    }
}
