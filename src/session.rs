use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::catalog::CaptureEntry;
use crate::mjr::index::FrameIndex;
use crate::mjr::writer::MjrWriter;
use crate::publish::LiveSink;
use crate::simulcast::vp8::Vp8SimulcastContext;
use crate::simulcast::{SimulcastContext, SwitchingContext};

/// What a handle is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    Capturer,
    Replayer,
}

/// Writers and live sink of a capturing session. The surrounding mutex is
/// the session's rec-mutex: it serializes frame writes against teardown.
#[derive(Default)]
pub struct RecordingState {
    pub audio: Option<MjrWriter>,
    pub video: Option<MjrWriter>,
    pub sink: Option<Arc<dyn LiveSink>>,
}

/// Frame lists a replaying session walks.
#[derive(Default)]
pub struct ReplayFrames {
    pub audio: Option<FrameIndex>,
    pub video: Option<FrameIndex>,
}

/// Simulcast state of a capturing session.
pub struct SimulcastState {
    /// SSRC of each negotiated substream, zero when not yet known.
    pub ssrcs: [u32; 3],
    /// rid of each substream, for rid-based simulcast.
    pub rids: [Option<String>; 3],
    pub context: SimulcastContext,
    pub switching: SwitchingContext,
    pub vp8: Vp8SimulcastContext,
}

impl Default for SimulcastState {
    fn default() -> Self {
        SimulcastState {
            ssrcs: [0; 3],
            rids: [None, None, None],
            context: SimulcastContext::default(),
            switching: SwitchingContext::default(),
            vp8: Vp8SimulcastContext::default(),
        }
    }
}

impl SimulcastState {
    pub fn enabled(&self) -> bool {
        self.ssrcs[0] != 0 || self.rids[0].is_some()
    }

    pub fn reset(&mut self) {
        *self = SimulcastState::default();
    }
}

/// REMB and keyframe-request state for the capture feedback loop.
pub struct FeedbackState {
    /// Target encoding bitrate, 1 mbps by default.
    pub bitrate: u32,
    /// Countdown of ramp-up REMBs still to send.
    pub remb_startup: u32,
    pub remb_last: Instant,
    /// Keyframe request interval in milliseconds, 15 seconds by default.
    pub keyframe_interval: u64,
    pub keyframe_last: Option<Instant>,
}

impl Default for FeedbackState {
    fn default() -> Self {
        FeedbackState {
            bitrate: 1024 * 1024,
            remb_startup: 4,
            remb_last: Instant::now(),
            keyframe_interval: 15_000,
            keyframe_last: None,
        }
    }
}

/// Per-handle runtime state.
pub struct Session {
    pub handle: u64,
    pub role: Mutex<Role>,
    pub entry: Mutex<Option<Arc<CaptureEntry>>>,
    pub rec: Mutex<RecordingState>,
    pub frames: Mutex<ReplayFrames>,
    pub simulcast: Mutex<SimulcastState>,
    pub feedback: Mutex<FeedbackState>,

    /// Stable SSRC stamped on captured video, masking substream switches.
    pub rec_vssrc: AtomicU32,
    pub fir_seq: AtomicU32,
    pub sdp_sessid: AtomicI64,
    pub sdp_version: AtomicI64,

    pub active: AtomicBool,
    hanging_up: AtomicBool,
    destroyed: AtomicBool,
}

impl Session {
    pub fn new(handle: u64) -> Session {
        Session {
            handle,
            role: Mutex::new(Role::Idle),
            entry: Mutex::new(None),
            rec: Mutex::new(RecordingState::default()),
            frames: Mutex::new(ReplayFrames::default()),
            simulcast: Mutex::new(SimulcastState::default()),
            feedback: Mutex::new(FeedbackState::default()),
            rec_vssrc: AtomicU32::new(0),
            fir_seq: AtomicU32::new(0),
            sdp_sessid: AtomicI64::new(0),
            sdp_version: AtomicI64::new(0),
            active: AtomicBool::new(false),
            hanging_up: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Tries to take the teardown latch; only the first caller wins.
    pub fn begin_hangup(&self) -> bool {
        self.hanging_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Re-arms the teardown latch, when a new negotiation starts.
    pub fn clear_hangup(&self) {
        self.hanging_up.store(false, Ordering::SeqCst);
    }

    pub fn hanging_up(&self) -> bool {
        self.hanging_up.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Marks the session destroyed; only the first caller wins.
    pub fn destroy(&self) -> bool {
        self.destroyed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
