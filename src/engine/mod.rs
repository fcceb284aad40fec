#[cfg(test)]
mod engine_test;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use util::marshal::Unmarshal;

use crate::catalog::nfo::NfoDescriptor;
use crate::catalog::{offer, Catalog, CaptureEntry, EntryMedia};
use crate::codec::{VideoCodec, DEFAULT_VIDEO_PT};
use crate::config::Config;
use crate::error::Result;
use crate::feedback;
use crate::gateway::Gateway;
use crate::mjr::index::FrameIndex;
use crate::mjr::writer::MjrWriter;
use crate::playout;
use crate::publish::SinkFactory;
use crate::session::{Role, Session};

/// Protocol errors surfaced in the error envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    NoMessage,
    InvalidJson(String),
    InvalidRequest(String),
    InvalidElement(String),
    MissingElement(String),
    NotFound(u64),
    InvalidCapture(String),
    InvalidState(String),
    InvalidSdp(String),
    CaptureExists(u64),
    Unknown(String),
}

impl ApiError {
    pub fn code(&self) -> u16 {
        match self {
            ApiError::NoMessage => 411,
            ApiError::InvalidJson(_) => 412,
            ApiError::InvalidRequest(_) => 413,
            ApiError::InvalidElement(_) => 414,
            ApiError::MissingElement(_) => 415,
            ApiError::NotFound(_) => 416,
            ApiError::InvalidCapture(_) => 417,
            ApiError::InvalidState(_) => 418,
            ApiError::InvalidSdp(_) => 419,
            ApiError::CaptureExists(_) => 420,
            ApiError::Unknown(_) => 499,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::NoMessage => "No message??".to_owned(),
            ApiError::InvalidJson(s) => format!("JSON error: {s}"),
            ApiError::InvalidRequest(s) => format!("Unknown request '{s}'"),
            ApiError::InvalidElement(s) => s.clone(),
            ApiError::MissingElement(s) => s.clone(),
            ApiError::NotFound(id) => format!("No such capture {id}"),
            ApiError::InvalidCapture(s) => s.clone(),
            ApiError::InvalidState(s) => s.clone(),
            ApiError::InvalidSdp(s) => s.clone(),
            ApiError::CaptureExists(id) => format!("Capture {id} already exists"),
            ApiError::Unknown(s) => s.clone(),
        }
    }
}

fn error_event(err: &ApiError) -> Value {
    json!({
        "transcode": "event",
        "error_code": err.code(),
        "error": err.message(),
    })
}

/// JSEP payload attached to a request at the host boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub simulcast: Option<SimulcastOffer>,
}

/// Simulcast layers the client negotiated, as relayed by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulcastOffer {
    #[serde(default)]
    pub ssrcs: Vec<u32>,
    #[serde(default)]
    pub rids: Vec<String>,
    #[serde(rename = "rid-ext-id", default)]
    pub rid_ext_id: Option<u8>,
}

/// Outcome of `handle_message`: synchronous verbs answer in place, the rest
/// are acknowledged and answered later through the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageResult {
    Response(Value),
    Pending,
}

struct QueuedMessage {
    handle: u64,
    transaction: Option<String>,
    message: Value,
    jsep: Option<Jsep>,
}

enum WorkItem {
    Message(Box<QueuedMessage>),
    Exit,
}

fn unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// The plugin core: capture catalog, sessions table and request worker,
/// built once at init and shared with the host callbacks.
pub struct Engine {
    inner: Arc<EngineInner>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct EngineInner {
    config: Config,
    gateway: Arc<dyn Gateway>,
    sinks: Arc<dyn SinkFactory>,
    catalog: Catalog,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    queue: mpsc::UnboundedSender<WorkItem>,
    stopping: AtomicBool,
}

impl Engine {
    /// Builds the engine: makes sure the capture directory exists, indexes
    /// whatever is already in it, and launches the request worker.
    pub async fn new(
        config: Config,
        gateway: Arc<dyn Gateway>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<Engine> {
        create_capture_dir(&config)?;
        let catalog = Catalog::new(config.path.clone());
        catalog.scan().await;

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            config,
            gateway,
            sinks,
            catalog,
            sessions: Mutex::new(HashMap::new()),
            queue: tx,
            stopping: AtomicBool::new(false),
        });
        let worker = tokio::spawn(EngineInner::worker_loop(Arc::clone(&inner), rx));
        Ok(Engine {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops the request worker. Pending messages are drained first.
    pub async fn close(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let _ = self.inner.queue.send(WorkItem::Exit);
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }

    pub async fn create_session(&self, handle: u64) {
        let session = Arc::new(Session::new(handle));
        self.inner.sessions.lock().await.insert(handle, session);
    }

    pub async fn destroy_session(&self, handle: u64) {
        let session = { self.inner.sessions.lock().await.remove(&handle) };
        let Some(session) = session else {
            log::error!("no session associated with handle {handle}");
            return;
        };
        log::debug!("removing session {handle}");
        self.inner.hangup_internal(&session).await;
        session.destroy();
    }

    /// Introspection for the host's admin surface.
    pub async fn query_session(&self, handle: u64) -> Option<Value> {
        let session = self.inner.session(handle).await?;
        let role = *session.role.lock().await;
        let mut info = json!({
            "type": match role {
                Role::Capturer => "capturer",
                Role::Replayer => "player",
                Role::Idle => "none",
            },
            "hanging_up": session.hanging_up(),
            "destroyed": session.destroyed(),
        });
        if let Some(entry) = session.entry.lock().await.as_ref() {
            info["capture_id"] = json!(entry.id);
            info["capture_name"] = json!(entry.name);
        }
        Some(info)
    }

    /// Entry point for client requests. `list`, `update` and `configure`
    /// answer synchronously; the media verbs are queued for the worker and
    /// acknowledged with [`MessageResult::Pending`].
    pub async fn handle_message(
        &self,
        handle: u64,
        transaction: Option<String>,
        message: Option<Value>,
        jsep: Option<Value>,
    ) -> MessageResult {
        match self
            .inner
            .handle_message(handle, transaction, message, jsep)
            .await
        {
            Ok(result) => result,
            Err(err) => MessageResult::Response(error_event(&err)),
        }
    }

    /// Admin API: only `update` is supported there.
    pub async fn handle_admin_message(&self, message: Value) -> Value {
        let Some(request) = message.get("request").and_then(Value::as_str) else {
            return error_event(&ApiError::MissingElement(
                "Missing element (request)".to_owned(),
            ));
        };
        if request == "update" {
            self.inner.catalog.scan().await;
            json!({ "transcode": "ok" })
        } else {
            error_event(&ApiError::InvalidRequest(request.to_owned()))
        }
    }

    /// Host signal: the peer connection is up. Replay sessions launch their
    /// pacer here.
    pub async fn setup_media(&self, handle: u64) {
        log::info!("[{handle}] WebRTC media is now available");
        let Some(session) = self.inner.session(handle).await else {
            log::error!("no session associated with handle {handle}");
            return;
        };
        if session.destroyed() {
            return;
        }
        session.clear_hangup();
        session.set_active(true);
        if *session.role.lock().await == Role::Replayer {
            let entry = session.entry.lock().await.clone();
            let Some(entry) = entry else {
                log::error!("no capture attached, can't start playout");
                self.inner.gateway.close_pc(handle).await;
                return;
            };
            tokio::spawn(playout::playout_task(
                Arc::clone(&self.inner.gateway),
                self.inner.config.path.clone(),
                session,
                entry,
            ));
        }
    }

    /// RTP ingest; runs on the host's I/O path and must not block.
    pub async fn incoming_rtp(&self, handle: u64, video: bool, packet: &[u8]) {
        self.inner.incoming_rtp(handle, video, packet).await;
    }

    /// RTCP from the peer; nothing to do with it here.
    pub async fn incoming_rtcp(&self, _handle: u64, _video: bool, _packet: &[u8]) {}

    /// Host signal: congestion on this session's link.
    pub async fn slow_link(&self, handle: u64, uplink: bool, video: bool) {
        let Some(session) = self.inner.session(handle).await else {
            return;
        };
        if session.destroyed() {
            return;
        }
        let mut result = json!({
            "status": "slow_link",
            "media": if video { "video" } else { "audio" },
            // What is uplink for us is downlink for the client.
            "uplink": if uplink { 0 } else { 1 },
        });
        if video {
            result["current-bitrate"] = json!(session.feedback.lock().await.bitrate);
        }
        let event = json!({ "transcode": "event", "result": result });
        self.inner
            .gateway
            .push_event(handle, None, event, None)
            .await;
    }

    /// Host signal: the peer connection is gone. Idempotent.
    pub async fn hangup_media(&self, handle: u64) {
        log::info!("[{handle}] no WebRTC media anymore");
        let Some(session) = self.inner.session(handle).await else {
            log::error!("no session associated with handle {handle}");
            return;
        };
        self.inner.hangup_internal(&session).await;
    }

    /// The capture catalog, mainly for inspection.
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }
}

fn create_capture_dir(config: &Config) -> Result<()> {
    if config.path.exists() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder
        .create(&config.path)
        .map_err(|e| crate::error::Error::ErrBadCaptureDir(e.to_string()))
}

impl EngineInner {
    async fn session(&self, handle: u64) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(&handle).cloned()
    }

    async fn handle_message(
        &self,
        handle: u64,
        transaction: Option<String>,
        message: Option<Value>,
        jsep: Option<Value>,
    ) -> std::result::Result<MessageResult, ApiError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ApiError::Unknown("Shutting down".to_owned()));
        }
        let session = self
            .session(handle)
            .await
            .ok_or_else(|| ApiError::Unknown("No session associated with this handle".to_owned()))?;
        if session.destroyed() {
            return Err(ApiError::Unknown(
                "Session has already been destroyed".to_owned(),
            ));
        }
        let message = message.ok_or(ApiError::NoMessage)?;
        if !message.is_object() {
            return Err(ApiError::InvalidJson("not an object".to_owned()));
        }
        let request = match message.get("request") {
            None => {
                return Err(ApiError::MissingElement(
                    "Missing element (request)".to_owned(),
                ))
            }
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(ApiError::InvalidElement(
                    "Invalid element (request should be a string)".to_owned(),
                ))
            }
        };

        match request.as_str() {
            "update" => {
                self.catalog.scan().await;
                Ok(MessageResult::Response(json!({ "transcode": "ok" })))
            }
            "list" => {
                log::debug!("request for the list of captures");
                let mut list = vec![];
                for entry in self.catalog.completed_entries().await {
                    let media = entry.media.lock().await;
                    let mut item = json!({
                        "id": entry.id,
                        "name": entry.name,
                        "date": entry.date,
                        "audio": media.audio_file.is_some(),
                        "video": media.video_file.is_some(),
                    });
                    if let Some(codec) = media.audio_codec {
                        item["audio_codec"] = json!(codec.name());
                    }
                    if let Some(codec) = media.video_codec {
                        item["video_codec"] = json!(codec.name());
                    }
                    list.push(item);
                }
                Ok(MessageResult::Response(
                    json!({ "transcode": "list", "list": list }),
                ))
            }
            "configure" => {
                let mut fb = session.feedback.lock().await;
                if let Some(bitrate) = message.get("video-bitrate-max") {
                    let bitrate = bitrate.as_u64().filter(|&b| b > 0).ok_or_else(|| {
                        ApiError::InvalidElement(
                            "Invalid element (video-bitrate-max should be a positive integer)"
                                .to_owned(),
                        )
                    })?;
                    fb.bitrate = bitrate.min(u32::MAX as u64) as u32;
                    log::debug!("video bitrate set to {}", fb.bitrate);
                }
                if let Some(interval) = message.get("video-keyframe-interval") {
                    let interval = interval.as_u64().filter(|&i| i > 0).ok_or_else(|| {
                        ApiError::InvalidElement(
                            "Invalid element (video-keyframe-interval should be a positive integer)"
                                .to_owned(),
                        )
                    })?;
                    fb.keyframe_interval = interval;
                    log::debug!("video keyframe interval set to {interval} ms");
                }
                Ok(MessageResult::Response(json!({
                    "transcode": "configure",
                    "status": "ok",
                    "settings": {
                        "video-keyframe-interval": fb.keyframe_interval,
                        "video-bitrate-max": fb.bitrate,
                    },
                })))
            }
            "transcode" | "play" | "start" | "stop" => {
                let jsep = match jsep {
                    None => None,
                    Some(raw) => Some(
                        serde_json::from_value::<Jsep>(raw)
                            .map_err(|e| ApiError::InvalidJson(e.to_string()))?,
                    ),
                };
                let queued = QueuedMessage {
                    handle,
                    transaction,
                    message,
                    jsep,
                };
                if self.queue.send(WorkItem::Message(Box::new(queued))).is_err() {
                    return Err(ApiError::Unknown("Shutting down".to_owned()));
                }
                Ok(MessageResult::Pending)
            }
            other => Err(ApiError::InvalidRequest(other.to_owned())),
        }
    }

    /// The single worker draining the async verb queue.
    async fn worker_loop(inner: Arc<EngineInner>, mut rx: mpsc::UnboundedReceiver<WorkItem>) {
        log::debug!("joining request worker");
        while let Some(item) = rx.recv().await {
            let msg = match item {
                WorkItem::Exit => break,
                WorkItem::Message(msg) => msg,
            };
            let Some(session) = inner.session(msg.handle).await else {
                log::error!("no session associated with handle {}", msg.handle);
                continue;
            };
            if session.destroyed() {
                continue;
            }
            let request = msg
                .message
                .get("request")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let outcome = match request.as_str() {
                "transcode" => inner.handle_transcode(&session, &msg).await,
                "play" => inner.handle_play(&session, &msg).await,
                "start" => inner.handle_start(&session, &msg).await,
                "stop" => inner.handle_stop(&session, &msg).await,
                other => Err(ApiError::InvalidRequest(other.to_owned())),
            };
            if let Err(err) = outcome {
                log::error!("request '{request}' failed: {}", err.message());
                inner
                    .gateway
                    .push_event(
                        msg.handle,
                        msg.transaction.as_deref(),
                        error_event(&err),
                        None,
                    )
                    .await;
            }
        }
        log::debug!("leaving request worker");
    }

    async fn handle_transcode(
        &self,
        session: &Arc<Session>,
        msg: &QueuedMessage,
    ) -> std::result::Result<(), ApiError> {
        let jsep = msg
            .jsep
            .as_ref()
            .filter(|j| j.kind.eq_ignore_ascii_case("offer"))
            .ok_or_else(|| ApiError::MissingElement("Missing SDP offer".to_owned()))?;
        let name = match msg.message.get("name") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) | None => {
                return Err(ApiError::MissingElement("Missing element (name)".to_owned()))
            }
            Some(_) => {
                return Err(ApiError::InvalidElement(
                    "Invalid element (name should be a string)".to_owned(),
                ))
            }
        };
        let filename = msg
            .message
            .get("filename")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let offer_sdp = offer::parse_sdp(&jsep.sdp)
            .map_err(|e| ApiError::InvalidSdp(format!("Error parsing offer: {e}")))?;

        // Renegotiation of an existing capture (e.g. an ICE restart).
        if jsep.update {
            let entry = session.entry.lock().await.clone();
            let role = *session.role.lock().await;
            let (Role::Capturer, Some(entry)) = (role, entry) else {
                return Err(ApiError::InvalidState(
                    "Not a capture session, can't update".to_owned(),
                ));
            };
            let version = session.sdp_version.fetch_add(1, Ordering::SeqCst) + 1;
            let media = entry.media.lock().await.clone();
            let answer = offer::generate_answer(
                &offer_sdp,
                entry.id,
                media.audio_codec,
                media.video_codec,
                session.sdp_sessid.load(Ordering::SeqCst) as u64,
                version as u64,
            )
            .map_err(|e| ApiError::InvalidSdp(e.to_string()))?;
            self.push_result_with_jsep(
                session,
                msg,
                json!({ "status": "transcoding", "id": entry.id }),
                "answer",
                answer,
                true,
            )
            .await;
            return Ok(());
        }

        let (audio_codec, video_codec) = offer::preferred_codecs(&offer_sdp);
        if audio_codec.is_none() && video_codec.is_none() {
            return Err(ApiError::InvalidSdp(
                "No supported codecs in the offer".to_owned(),
            ));
        }

        let id = match msg.message.get("id") {
            None => self.catalog.random_id().await,
            Some(raw) => {
                let id = raw.as_u64().filter(|&id| id > 0).ok_or_else(|| {
                    ApiError::InvalidElement(
                        "Invalid element (id should be a positive integer)".to_owned(),
                    )
                })?;
                id
            }
        };
        log::debug!("starting new capture with id {id}");

        let date = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let audio_file = audio_codec.map(|_| match &filename {
            Some(base) => format!("{base}-audio"),
            None => format!("rec-{id}-audio"),
        });
        let video_file = video_codec.map(|_| match &filename {
            Some(base) => format!("{base}-video"),
            None => format!("rec-{id}-video"),
        });
        let media = EntryMedia {
            audio_file: audio_file.clone(),
            video_file: video_file.clone(),
            audio_codec,
            video_codec,
            audio_pt: audio_codec.map(|c| c.payload_type()).unwrap_or_default(),
            video_pt: DEFAULT_VIDEO_PT,
            offer: None,
        };
        let entry = Arc::new(CaptureEntry::new(id, name, date, media));
        if !self.catalog.insert(Arc::clone(&entry)).await {
            return Err(ApiError::CaptureExists(id));
        }

        // Wire the session up: writers, live sink, simulcast.
        {
            let mut rec = session.rec.lock().await;
            rec.audio = match (audio_codec, &audio_file) {
                (Some(codec), Some(file)) => {
                    Some(MjrWriter::new(&self.config.path, codec.name(), false, file))
                }
                _ => None,
            };
            rec.video = match (video_codec, &video_file) {
                (Some(codec), Some(file)) => {
                    Some(MjrWriter::new(&self.config.path, codec.name(), true, file))
                }
                _ => None,
            };
            if let Some(rtmp) = &self.config.rtmp {
                let url = format!("{rtmp}/{id}");
                match self.sinks.open(&url, audio_codec, video_codec).await {
                    Ok(sink) => rec.sink = Some(sink),
                    Err(e) => log::warn!("couldn't open live sink {url}: {e}"),
                }
            }
        }
        *session.role.lock().await = Role::Capturer;
        *session.entry.lock().await = Some(Arc::clone(&entry));
        session.sdp_sessid.store(unix_micros(), Ordering::SeqCst);
        session.sdp_version.store(1, Ordering::SeqCst);

        if let Some(simulcast) = &jsep.simulcast {
            let simulcastable = matches!(video_codec, Some(VideoCodec::Vp8) | Some(VideoCodec::H264));
            if simulcastable {
                log::debug!("capture client negotiated simulcasting");
                let mut sim = session.simulcast.lock().await;
                for (i, ssrc) in simulcast.ssrcs.iter().take(3).enumerate() {
                    sim.ssrcs[i] = *ssrc;
                }
                for (i, rid) in simulcast.rids.iter().take(3).enumerate() {
                    sim.rids[i] = Some(rid.clone());
                }
                sim.context.rid_ext_id = simulcast.rid_ext_id;
                // Aim for the highest quality and all temporal layers.
                sim.context.substream_target = 2;
                sim.context.templayer_target = 2;
            }
        }

        let answer = offer::generate_answer(
            &offer_sdp,
            id,
            audio_codec,
            video_codec,
            session.sdp_sessid.load(Ordering::SeqCst) as u64,
            1,
        )
        .map_err(|e| ApiError::InvalidSdp(e.to_string()))?;
        self.push_result_with_jsep(
            session,
            msg,
            json!({ "status": "transcoding", "id": id }),
            "answer",
            answer,
            false,
        )
        .await;

        if self.config.events && self.gateway.events_enabled() {
            self.gateway
                .notify_event(
                    session.handle,
                    json!({
                        "event": "transcoding",
                        "id": id,
                        "audio": audio_file.is_some(),
                        "video": video_file.is_some(),
                    }),
                )
                .await;
        }
        Ok(())
    }

    async fn handle_play(
        &self,
        session: &Arc<Session>,
        msg: &QueuedMessage,
    ) -> std::result::Result<(), ApiError> {
        if msg.jsep.is_some() {
            return Err(ApiError::InvalidElement(
                "A play request can't contain an SDP".to_owned(),
            ));
        }
        log::debug!("replaying a capture");
        let restart = msg
            .message
            .get("restart")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // ICE restart on an existing playout: re-send the cached offer.
        if restart {
            let entry = session.entry.lock().await.clone();
            let role = *session.role.lock().await;
            let (Role::Replayer, Some(entry)) = (role, entry) else {
                return Err(ApiError::InvalidState(
                    "Not a playout session, can't restart".to_owned(),
                ));
            };
            let cached = entry.media.lock().await.offer.clone().ok_or_else(|| {
                ApiError::InvalidState("Invalid offer, can't restart".to_owned())
            })?;
            let version = session.sdp_version.fetch_add(1, Ordering::SeqCst) + 1;
            let sdp = offer::rewrite_origin(
                &cached,
                session.sdp_sessid.load(Ordering::SeqCst) as u64,
                version as u64,
            )
            .map_err(|e| ApiError::InvalidState(e.to_string()))?;
            self.push_result_with_jsep(
                session,
                msg,
                json!({ "status": "restarting", "id": entry.id }),
                "offer",
                sdp,
                true,
            )
            .await;
            return Ok(());
        }

        let id = msg
            .message
            .get("id")
            .ok_or_else(|| ApiError::MissingElement("Missing element (id)".to_owned()))?
            .as_u64()
            .filter(|&id| id > 0)
            .ok_or_else(|| {
                ApiError::InvalidElement(
                    "Invalid element (id should be a positive integer)".to_owned(),
                )
            })?;
        let entry = self
            .catalog
            .get(id)
            .await
            .filter(|e| !e.destroyed())
            .ok_or(ApiError::NotFound(id))?;
        let media = entry.media.lock().await.clone();
        let cached_offer = media.offer.clone().ok_or(ApiError::NotFound(id))?;

        // Index the capture files; a broken side degrades with a warning.
        let mut warning = None;
        let mut aframes = None;
        let mut vframes = None;
        if let Some(name) = &media.audio_file {
            match FrameIndex::parse(&self.config.path, name) {
                Ok(index) if !index.is_empty() => aframes = Some(index),
                Ok(_) | Err(_) => {
                    log::warn!("error opening audio capture, trying to go on anyway");
                    warning = Some("Broken audio file, playing video only");
                }
            }
        }
        if let Some(name) = &media.video_file {
            match FrameIndex::parse(&self.config.path, name) {
                Ok(index) if !index.is_empty() => vframes = Some(index),
                Ok(_) | Err(_) => {
                    log::warn!("error opening video capture, trying to go on anyway");
                    warning = Some("Broken video file, playing audio only");
                }
            }
        }
        if aframes.is_none() && vframes.is_none() {
            return Err(ApiError::InvalidCapture(
                "Error opening capture files".to_owned(),
            ));
        }

        {
            let mut frames = session.frames.lock().await;
            frames.audio = aframes;
            frames.video = vframes;
        }
        *session.role.lock().await = Role::Replayer;
        *session.entry.lock().await = Some(Arc::clone(&entry));
        session.sdp_sessid.store(unix_micros(), Ordering::SeqCst);
        session.sdp_version.store(1, Ordering::SeqCst);
        entry.add_viewer(session.handle).await;

        let mut result = json!({ "status": "preparing", "id": id });
        if let Some(warning) = warning {
            result["warning"] = json!(warning);
        }
        self.push_result_with_jsep(session, msg, result, "offer", cached_offer, false)
            .await;

        if self.config.events && self.gateway.events_enabled() {
            let frames = session.frames.lock().await;
            self.gateway
                .notify_event(
                    session.handle,
                    json!({
                        "event": "playout",
                        "id": id,
                        "audio": frames.audio.is_some(),
                        "video": frames.video.is_some(),
                    }),
                )
                .await;
        }
        Ok(())
    }

    async fn handle_start(
        &self,
        session: &Arc<Session>,
        msg: &QueuedMessage,
    ) -> std::result::Result<(), ApiError> {
        {
            let frames = session.frames.lock().await;
            if frames.audio.is_none() && frames.video.is_none() {
                return Err(ApiError::InvalidState(
                    "Not a playout session, can't start".to_owned(),
                ));
            }
        }
        // The start message just closes the loop with the client's answer.
        if msg.jsep.is_none() {
            return Err(ApiError::MissingElement("Missing SDP answer".to_owned()));
        }
        self.push_result(session, msg, json!({ "status": "playing" }))
            .await;
        if self.config.events && self.gateway.events_enabled() {
            let id = session.entry.lock().await.as_ref().map(|e| e.id);
            self.gateway
                .notify_event(session.handle, json!({ "event": "playing", "id": id }))
                .await;
        }
        Ok(())
    }

    async fn handle_stop(
        &self,
        session: &Arc<Session>,
        msg: &QueuedMessage,
    ) -> std::result::Result<(), ApiError> {
        let mut result = json!({ "status": "stopped" });
        let id = session.entry.lock().await.as_ref().map(|e| e.id);
        if let Some(id) = id {
            result["id"] = json!(id);
            if self.config.events && self.gateway.events_enabled() {
                self.gateway
                    .notify_event(session.handle, json!({ "event": "stopped", "id": id }))
                    .await;
            }
        }
        self.push_result(session, msg, result).await;
        // The host tears the peer connection down; hangup_media does the rest.
        self.gateway.close_pc(session.handle).await;
        Ok(())
    }

    async fn push_result(&self, session: &Arc<Session>, msg: &QueuedMessage, result: Value) {
        let event = json!({ "transcode": "event", "result": result });
        self.gateway
            .push_event(session.handle, msg.transaction.as_deref(), event, None)
            .await;
    }

    async fn push_result_with_jsep(
        &self,
        session: &Arc<Session>,
        msg: &QueuedMessage,
        result: Value,
        kind: &str,
        sdp: String,
        restart: bool,
    ) {
        let event = json!({ "transcode": "event", "result": result });
        let mut jsep = json!({ "type": kind, "sdp": sdp });
        if restart {
            jsep["restart"] = json!(true);
        }
        // A fresh negotiation is starting, re-arm the teardown latch.
        session.clear_hangup();
        self.gateway
            .push_event(session.handle, msg.transaction.as_deref(), event, Some(jsep))
            .await;
    }

    async fn incoming_rtp(&self, handle: u64, video: bool, packet: &[u8]) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let Some(session) = self.session(handle).await else {
            return;
        };
        if session.destroyed() || session.hanging_up() {
            return;
        }
        if *session.role.lock().await != Role::Capturer {
            return;
        }
        let entry = session.entry.lock().await.clone();
        let Some(entry) = entry else {
            return;
        };

        let simulcast_enabled = video && session.simulcast.lock().await.enabled();
        if simulcast_enabled {
            if !self.capture_simulcast_rtp(&session, &entry, packet).await {
                return;
            }
        } else {
            let mut rec = session.rec.lock().await;
            let writer = if video { &mut rec.video } else { &mut rec.audio };
            if let Some(writer) = writer {
                if let Err(e) = writer.save_frame(packet) {
                    log::error!("couldn't save {} frame: {e}", if video { "video" } else { "audio" });
                }
            }
            if let Some(sink) = rec.sink.clone() {
                drop(rec);
                if let Err(e) = sink.push(packet, video, 1).await {
                    log::warn!("live sink push failed: {e}");
                }
            }
        }

        if video {
            feedback::process(&session, self.gateway.as_ref()).await;
        }
    }

    /// Simulcast path: selects the layer, keeps the outgoing stream
    /// continuous, stamps the stable capture SSRC and only then hands the
    /// packet to the writer and the live sink. The ingest buffer itself is
    /// never modified, so the host's stream statistics stay intact.
    async fn capture_simulcast_rtp(
        &self,
        session: &Arc<Session>,
        entry: &Arc<CaptureEntry>,
        packet: &[u8],
    ) -> bool {
        let parsed = match rtp::packet::Packet::unmarshal(&mut &packet[..]) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("invalid RTP packet: {e}");
                return false;
            }
        };
        let payload_at = packet.len() - parsed.payload.len();
        let vcodec = entry
            .media
            .lock()
            .await
            .video_codec
            .unwrap_or(VideoCodec::Vp8);

        let mut sim = session.simulcast.lock().await;
        let keep = {
            let sim = &mut *sim;
            sim.context.process(
                &parsed.header,
                &parsed.payload,
                &mut sim.ssrcs,
                &sim.rids,
                vcodec,
            )
        };
        if sim.context.need_pli {
            log::debug!("we need a PLI for the simulcast context");
            sim.context.need_pli = false;
            if let Ok(buf) = feedback::pli_packet() {
                self.gateway.relay_rtcp(session.handle, true, &buf).await;
            }
        }
        if !keep {
            return false;
        }

        let (out_seq, out_ts) = sim.switching.update(
            parsed.header.ssrc,
            parsed.header.sequence_number,
            parsed.header.timestamp,
        );
        let changed_substream = sim.context.changed_substream;

        // Capture copy: rewritten header plus, for VP8, a rewritten payload
        // descriptor; a stable SSRC masks the substream switches.
        let mut out = packet.to_vec();
        out[2..4].copy_from_slice(&out_seq.to_be_bytes());
        out[4..8].copy_from_slice(&out_ts.to_be_bytes());
        if vcodec == VideoCodec::Vp8 {
            sim.vp8
                .update_descriptor(&mut out[payload_at..], changed_substream);
        }
        let mut vssrc = session.rec_vssrc.load(Ordering::SeqCst);
        if vssrc == 0 {
            vssrc = rand::random::<u32>() | 1;
            session.rec_vssrc.store(vssrc, Ordering::SeqCst);
        }
        out[8..12].copy_from_slice(&vssrc.to_be_bytes());
        drop(sim);

        let mut rec = session.rec.lock().await;
        if let Some(writer) = &mut rec.video {
            if let Err(e) = writer.save_frame(&out) {
                log::error!("couldn't save video frame: {e}");
            }
        }
        if let Some(sink) = rec.sink.clone() {
            drop(rec);
            if let Err(e) = sink.push(&out, true, 1).await {
                log::warn!("live sink push failed: {e}");
            }
        }
        true
    }

    /// The idempotent teardown path shared by `stop`, `hangup_media` and
    /// `destroy_session`. Only the first caller gets past the latch.
    async fn hangup_internal(&self, session: &Arc<Session>) {
        session.set_active(false);
        if session.destroyed() {
            return;
        }
        if !session.begin_hangup() {
            return;
        }
        session.simulcast.lock().await.reset();
        session.rec_vssrc.store(0, Ordering::SeqCst);

        // Tell the client it's over.
        let event = json!({ "transcode": "event", "result": "done" });
        self.gateway
            .push_event(session.handle, None, event, None)
            .await;

        let (audio_written, video_written) = {
            let mut rec = session.rec.lock().await;
            let audio_written = match rec.audio.take() {
                Some(mut writer) => {
                    let wrote = writer.frames() > 0;
                    if let Err(e) = writer.close() {
                        log::error!("couldn't close audio capture: {e}");
                    } else if wrote {
                        log::info!("closed audio capture {}", writer.path().display());
                    }
                    Some(wrote)
                }
                None => None,
            };
            let video_written = match rec.video.take() {
                Some(mut writer) => {
                    let wrote = writer.frames() > 0;
                    if let Err(e) = writer.close() {
                        log::error!("couldn't close video capture: {e}");
                    } else if wrote {
                        log::info!("closed video capture {}", writer.path().display());
                    }
                    Some(wrote)
                }
                None => None,
            };
            if let Some(sink) = rec.sink.take() {
                sink.close().await;
                log::info!("closed live sink");
            }
            (audio_written, video_written)
        };

        let role = *session.role.lock().await;
        let entry = session.entry.lock().await.take();
        match (role, entry) {
            (Role::Capturer, Some(entry)) => {
                self.finalize_capture(&entry, audio_written, video_written)
                    .await;
            }
            (Role::Replayer, Some(entry)) => {
                entry.remove_viewer(session.handle).await;
            }
            (Role::Capturer, None) => {
                log::warn!("got a stop but missing capture, .nfo may not have been generated");
            }
            _ => {}
        }
    }

    /// Seals a finished capture: the `.nfo` only names the files that were
    /// actually written, the entry flips to completed and the replay offer
    /// is prepared and cached.
    async fn finalize_capture(
        &self,
        entry: &Arc<CaptureEntry>,
        audio_written: Option<bool>,
        video_written: Option<bool>,
    ) {
        let mut media = entry.media.lock().await;
        if audio_written != Some(true) {
            media.audio_file = None;
            media.audio_codec = None;
        }
        if video_written != Some(true) {
            media.video_file = None;
            media.video_codec = None;
        }
        if media.audio_file.is_none() && media.video_file.is_none() {
            log::warn!("capture {} produced no media, leaving it incomplete", entry.id);
            return;
        }
        let desc = NfoDescriptor {
            id: entry.id,
            name: entry.name.clone(),
            date: entry.date.clone(),
            audio: media.audio_file.as_ref().map(|f| format!("{f}.mjr")),
            video: media.video_file.as_ref().map(|f| format!("{f}.mjr")),
        };
        let path = self.config.path.join(format!("{}.nfo", entry.id));
        if let Err(e) = std::fs::write(&path, desc.render()) {
            log::error!("error creating file {}: {e}", path.display());
            return;
        }
        media.refresh_offer(entry.id);
        entry.mark_completed();
    }
}
