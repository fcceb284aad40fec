
pub mod nfo;
pub mod offer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::codec::{AudioCodec, VideoCodec, DEFAULT_AUDIO_PT, DEFAULT_VIDEO_PT};
use crate::mjr;
use self::nfo::NfoDescriptor;

/// Mutable part of a capture entry: which files it maps to, their codecs and
/// replay payload types, and the cached viewer offer.
#[derive(Debug, Default, Clone)]
pub struct EntryMedia {
    /// Logical audio file name, without the `.mjr` extension.
    pub audio_file: Option<String>,
    /// Logical video file name, without the `.mjr` extension.
    pub video_file: Option<String>,
    pub audio_codec: Option<AudioCodec>,
    pub video_codec: Option<VideoCodec>,
    pub audio_pt: u8,
    pub video_pt: u8,
    /// SDP offer sent to viewers, prepared when the capture completes.
    pub offer: Option<String>,
}

impl EntryMedia {
    pub fn has_audio(&self) -> bool {
        self.audio_file.is_some() && self.audio_codec.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.video_file.is_some() && self.video_codec.is_some()
    }

    /// Regenerates the cached viewer offer from the current media.
    pub fn refresh_offer(&mut self, id: u64) {
        let audio = self
            .audio_codec
            .filter(|_| self.audio_file.is_some())
            .map(|c| (c, self.audio_pt));
        let video = self
            .video_codec
            .filter(|_| self.video_file.is_some())
            .map(|c| (c, self.video_pt));
        match offer::generate_offer(id, audio, video) {
            Ok(sdp) => self.offer = Some(sdp),
            Err(e) => log::warn!("could not generate offer for capture {id}: {e}"),
        }
    }
}

/// One capture known to the catalog.
///
/// The `Arc` holding an entry is its reference count: the catalog keeps one,
/// the capturing session keeps one while writing, and every viewer keeps one
/// while replaying, so removal from the catalog never pulls an entry out from
/// under an active session.
#[derive(Debug)]
pub struct CaptureEntry {
    pub id: u64,
    pub name: String,
    /// Local-time `YYYY-MM-DD HH:MM:SS`.
    pub date: String,
    pub media: Mutex<EntryMedia>,
    /// Handles of the replay sessions currently attached.
    pub viewers: Mutex<Vec<u64>>,
    completed: AtomicBool,
    destroyed: AtomicBool,
}

impl CaptureEntry {
    pub fn new(id: u64, name: String, date: String, media: EntryMedia) -> CaptureEntry {
        CaptureEntry {
            id,
            name,
            date,
            media: Mutex::new(media),
            viewers: Mutex::new(vec![]),
            completed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub async fn add_viewer(&self, handle: u64) {
        self.viewers.lock().await.push(handle);
    }

    pub async fn remove_viewer(&self, handle: u64) {
        self.viewers.lock().await.retain(|&h| h != handle);
    }
}

/// In-memory map of capture entries, reconciled against the `.nfo` files in
/// the capture directory. All mutation goes through one mutex.
pub struct Catalog {
    dir: PathBuf,
    entries: Mutex<HashMap<u64, Arc<CaptureEntry>>>,
}

impl Catalog {
    pub fn new(dir: PathBuf) -> Catalog {
        Catalog {
            dir,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get(&self, id: u64) -> Option<Arc<CaptureEntry>> {
        self.entries.lock().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: u64) -> bool {
        self.entries.lock().await.contains_key(&id)
    }

    /// Inserts a new entry; fails when the id is already taken.
    pub async fn insert(&self, entry: Arc<CaptureEntry>) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&entry.id) {
            return false;
        }
        entries.insert(entry.id, entry);
        true
    }

    pub async fn remove(&self, id: u64) -> Option<Arc<CaptureEntry>> {
        let entry = self.entries.lock().await.remove(&id);
        if let Some(entry) = &entry {
            entry.mark_destroyed();
        }
        entry
    }

    /// Picks an unused random id under the catalog lock.
    pub async fn random_id(&self) -> u64 {
        let entries = self.entries.lock().await;
        loop {
            let id = rand::random::<u64>();
            if id != 0 && !entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Snapshot of the completed entries, for `list`.
    pub async fn completed_entries(&self) -> Vec<Arc<CaptureEntry>> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.completed() && !e.destroyed())
            .cloned()
            .collect()
    }

    /// Scans the capture directory for `.nfo` descriptors, imports the ones
    /// we don't know yet, and forgets entries whose descriptor disappeared.
    pub async fn scan(&self) {
        log::debug!("updating capture list in {}", self.dir.display());
        let mut entries = self.entries.lock().await;
        let mut stale: Vec<u64> = entries.keys().copied().collect();

        let dir = match std::fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) => {
                log::error!("couldn't open capture folder: {e}");
                return;
            }
        };
        for item in dir.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("nfo") {
                continue;
            }
            log::debug!("importing capture '{}'", path.display());
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("couldn't read '{}': {e}", path.display());
                    continue;
                }
            };
            let desc = match NfoDescriptor::parse(&content) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("invalid capture '{}': {e}", path.display());
                    continue;
                }
            };
            if entries.contains_key(&desc.id) {
                log::debug!("capture {} already in the list, skipping", desc.id);
                stale.retain(|&id| id != desc.id);
                continue;
            }
            match self.import(desc) {
                Some(entry) => {
                    entries.insert(entry.id, Arc::new(entry));
                }
                None => log::warn!("no usable media in '{}', skipping", path.display()),
            }
        }

        // Whatever wasn't touched lost its .nfo in the meanwhile.
        for id in stale {
            log::debug!("capture {id} is not available anymore, removing");
            if let Some(entry) = entries.remove(&id) {
                entry.mark_destroyed();
            }
        }
    }

    /// Builds an entry from a parsed descriptor, probing each named file for
    /// its codec. A side whose file can't be probed is dropped; an entry left
    /// with no media at all is rejected.
    fn import(&self, desc: NfoDescriptor) -> Option<CaptureEntry> {
        let mut media = EntryMedia {
            audio_pt: DEFAULT_AUDIO_PT,
            video_pt: DEFAULT_VIDEO_PT,
            ..Default::default()
        };
        if let Some(audio) = desc.audio {
            let name = audio.trim_end_matches(".mjr").to_owned();
            match mjr::probe_codec(&self.dir, &name) {
                Ok(probe) if !probe.video => {
                    media.audio_codec = probe.audio_codec;
                    media.audio_file = Some(name);
                }
                Ok(_) => log::warn!("audio file of capture {} holds video, dropping", desc.id),
                Err(e) => log::warn!("couldn't probe audio of capture {}: {e}", desc.id),
            }
        }
        if let Some(video) = desc.video {
            let name = video.trim_end_matches(".mjr").to_owned();
            match mjr::probe_codec(&self.dir, &name) {
                Ok(probe) if probe.video => {
                    media.video_codec = probe.video_codec;
                    media.video_file = Some(name);
                }
                Ok(_) => log::warn!("video file of capture {} holds audio, dropping", desc.id),
                Err(e) => log::warn!("couldn't probe video of capture {}: {e}", desc.id),
            }
        }
        if !media.has_audio() && !media.has_video() {
            return None;
        }
        if let Some(codec) = media.audio_codec {
            media.audio_pt = codec.payload_type();
        }
        media.refresh_offer(desc.id);

        let entry = CaptureEntry::new(desc.id, desc.name, desc.date, media);
        entry.mark_completed();
        Some(entry)
    }
}
