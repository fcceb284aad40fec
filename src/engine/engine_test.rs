use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::publish::NoopSinkFactory;

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

const AUDIO_OFFER: &str = "v=0\r\n\
o=- 1234 1 IN IP4 127.0.0.1\r\n\
s=capture\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 127.0.0.1\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendrecv\r\n";

const VIDEO_OFFER: &str = "v=0\r\n\
o=- 1234 1 IN IP4 127.0.0.1\r\n\
s=capture\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 127.0.0.1\r\n\
a=mid:0\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=sendrecv\r\n";

#[derive(Default)]
struct MockGateway {
    events: StdMutex<Vec<(u64, Value, Option<Value>)>>,
    rtcp: StdMutex<Vec<Vec<u8>>>,
    closed: StdMutex<Vec<u64>>,
}

#[async_trait]
impl Gateway for MockGateway {
    async fn relay_rtp(&self, _handle: u64, _video: bool, _packet: &[u8]) {}

    async fn relay_rtcp(&self, _handle: u64, _video: bool, packet: &[u8]) {
        self.rtcp.lock().unwrap().push(packet.to_vec());
    }

    async fn push_event(
        &self,
        handle: u64,
        _transaction: Option<&str>,
        event: Value,
        jsep: Option<Value>,
    ) {
        self.events.lock().unwrap().push((handle, event, jsep));
    }

    async fn notify_event(&self, _handle: u64, _info: Value) {}

    fn events_enabled(&self) -> bool {
        false
    }

    async fn close_pc(&self, handle: u64) {
        self.closed.lock().unwrap().push(handle);
    }
}

impl MockGateway {
    fn pop_event(&self) -> Option<(u64, Value, Option<Value>)> {
        let mut events = self.events.lock().unwrap();
        if events.is_empty() {
            None
        } else {
            Some(events.remove(0))
        }
    }

    fn done_events(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e, _)| e["result"] == json!("done"))
            .count()
    }
}

async fn wait_event(gateway: &MockGateway) -> (u64, Value, Option<Value>) {
    for _ in 0..200 {
        if let Some(event) = gateway.pop_event() {
            return event;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no event from the worker");
}

async fn new_engine(dir: &PathBuf, gateway: Arc<MockGateway>) -> Engine {
    Engine::new(
        Config::new(dir.clone()),
        gateway,
        Arc::new(NoopSinkFactory),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_list_empty_directory() {
    let dir = temp_dir("engine-empty");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    let result = engine
        .handle_message(1, None, Some(json!({"request": "list"})), None)
        .await;
    assert_eq!(
        result,
        MessageResult::Response(json!({"transcode": "list", "list": []}))
    );

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_capture_stop_list_cycle() {
    let dir = temp_dir("engine-cycle");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    // Ask to capture with a client-proposed id and an Opus-only offer.
    let result = engine
        .handle_message(
            1,
            Some("t1".to_owned()),
            Some(json!({"request": "transcode", "name": "take one", "id": 42})),
            Some(json!({"type": "offer", "sdp": AUDIO_OFFER})),
        )
        .await;
    assert_eq!(result, MessageResult::Pending);

    let (handle, event, jsep) = wait_event(&gateway).await;
    assert_eq!(handle, 1);
    assert_eq!(event["result"]["status"], json!("transcoding"));
    assert_eq!(event["result"]["id"], json!(42));
    let jsep = jsep.expect("answer attached");
    assert_eq!(jsep["type"], json!("answer"));
    let sdp = jsep["sdp"].as_str().unwrap();
    assert!(sdp.contains("recvonly"));
    assert!(sdp.contains("opus/48000/2"));

    // Media comes up and a hundred packets arrive.
    engine.setup_media(1).await;
    for i in 0u16..100 {
        let pkt = rtp_packet(111, 200 + i, 8000 + i as u32 * 960, 0xABCD, &[0x55; 40]);
        engine.incoming_rtp(1, false, &pkt).await;
    }

    // Stop the capture; the host reacts to close_pc with hangup_media.
    let result = engine
        .handle_message(1, None, Some(json!({"request": "stop"})), None)
        .await;
    assert_eq!(result, MessageResult::Pending);
    let (_, event, _) = wait_event(&gateway).await;
    assert_eq!(event["result"]["status"], json!("stopped"));
    assert_eq!(event["result"]["id"], json!(42));
    assert_eq!(*gateway.closed.lock().unwrap(), vec![1]);
    engine.hangup_media(1).await;

    // The directory now holds the capture and its descriptor.
    assert!(dir.join("rec-42-audio.mjr").exists());
    assert!(dir.join("42.nfo").exists());
    assert!(!dir.join("rec-42-video.mjr").exists());

    // And the capture is listed, completed, with its codec.
    let result = engine
        .handle_message(1, None, Some(json!({"request": "list"})), None)
        .await;
    let MessageResult::Response(response) = result else {
        panic!("list must answer synchronously");
    };
    let list = response["list"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], json!(42));
    assert_eq!(list[0]["audio_codec"], json!("opus"));
    assert_eq!(list[0]["audio"], json!(true));
    assert_eq!(list[0]["video"], json!(false));

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_capture_id_collision() {
    let dir = temp_dir("engine-collision");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;
    engine.create_session(2).await;

    for handle in [1u64, 2] {
        engine
            .handle_message(
                handle,
                None,
                Some(json!({"request": "transcode", "name": "dup", "id": 7})),
                Some(json!({"type": "offer", "sdp": AUDIO_OFFER})),
            )
            .await;
        let (got, event, _) = wait_event(&gateway).await;
        assert_eq!(got, handle);
        if handle == 1 {
            assert_eq!(event["result"]["status"], json!("transcoding"));
        } else {
            assert_eq!(event["error_code"], json!(420));
        }
    }

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

async fn wait_events_at_least(gateway: &MockGateway, n: usize) {
    for _ in 0..200 {
        if gateway.events.lock().unwrap().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {n} events");
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = temp_dir("engine-idem");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    engine
        .handle_message(
            1,
            None,
            Some(json!({"request": "transcode", "name": "once", "id": 9})),
            Some(json!({"type": "offer", "sdp": AUDIO_OFFER})),
        )
        .await;
    wait_events_at_least(&gateway, 1).await;
    engine.setup_media(1).await;
    engine
        .incoming_rtp(1, false, &rtp_packet(111, 1, 960, 0xABCD, &[0x11; 20]))
        .await;

    // Two stops, two hangups: one .nfo, one done event.
    engine
        .handle_message(1, None, Some(json!({"request": "stop"})), None)
        .await;
    wait_events_at_least(&gateway, 2).await;
    engine.hangup_media(1).await;
    engine
        .handle_message(1, None, Some(json!({"request": "stop"})), None)
        .await;
    wait_events_at_least(&gateway, 4).await;
    engine.hangup_media(1).await;

    let nfos: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("nfo"))
        .collect();
    assert_eq!(nfos.len(), 1);
    assert_eq!(gateway.done_events(), 1);

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_incomplete_captures_are_not_listed() {
    let dir = temp_dir("engine-incomplete");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    engine
        .handle_message(
            1,
            None,
            Some(json!({"request": "transcode", "name": "running", "id": 5})),
            Some(json!({"type": "offer", "sdp": AUDIO_OFFER})),
        )
        .await;
    wait_event(&gateway).await;

    // The capture is ongoing: list must not show it.
    let result = engine
        .handle_message(1, None, Some(json!({"request": "list"})), None)
        .await;
    let MessageResult::Response(response) = result else {
        panic!("list must answer synchronously");
    };
    assert_eq!(response["list"].as_array().unwrap().len(), 0);

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_play_and_start_flow() {
    let dir = temp_dir("engine-play");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    // Produce a completed capture first.
    engine
        .handle_message(
            1,
            None,
            Some(json!({"request": "transcode", "name": "source", "id": 42})),
            Some(json!({"type": "offer", "sdp": AUDIO_OFFER})),
        )
        .await;
    wait_event(&gateway).await;
    engine.setup_media(1).await;
    for i in 0u16..10 {
        engine
            .incoming_rtp(1, false, &rtp_packet(111, i, i as u32 * 960, 0xABCD, &[0x22; 30]))
            .await;
    }
    engine.hangup_media(1).await;
    assert_eq!(gateway.done_events(), 1);
    gateway.events.lock().unwrap().clear();

    // A viewer shows up.
    engine.create_session(2).await;
    engine
        .handle_message(2, None, Some(json!({"request": "play", "id": 42})), None)
        .await;
    let (handle, event, jsep) = wait_event(&gateway).await;
    assert_eq!(handle, 2);
    assert_eq!(event["result"]["status"], json!("preparing"));
    assert_eq!(event["result"]["id"], json!(42));
    let jsep = jsep.expect("offer attached");
    assert_eq!(jsep["type"], json!("offer"));
    let sdp = jsep["sdp"].as_str().unwrap();
    assert!(sdp.contains("sendonly"));
    assert!(sdp.contains("opus"));

    // start without an SDP answer is refused.
    engine
        .handle_message(2, None, Some(json!({"request": "start"})), None)
        .await;
    let (_, event, _) = wait_event(&gateway).await;
    assert_eq!(event["error_code"], json!(415));

    // With the answer it goes through.
    engine
        .handle_message(
            2,
            None,
            Some(json!({"request": "start"})),
            Some(json!({"type": "answer", "sdp": AUDIO_OFFER})),
        )
        .await;
    let (_, event, _) = wait_event(&gateway).await;
    assert_eq!(event["result"]["status"], json!("playing"));

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_play_unknown_capture() {
    let dir = temp_dir("engine-notfound");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    engine
        .handle_message(1, None, Some(json!({"request": "play", "id": 12345})), None)
        .await;
    let (_, event, _) = wait_event(&gateway).await;
    assert_eq!(event["error_code"], json!(416));

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_unknown_request_and_configure_echo() {
    let dir = temp_dir("engine-misc");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    // Unrecognized verbs answer 413 synchronously.
    let result = engine
        .handle_message(1, None, Some(json!({"request": "bogus"})), None)
        .await;
    let MessageResult::Response(response) = result else {
        panic!("errors answer synchronously");
    };
    assert_eq!(response["error_code"], json!(413));

    // No message at all answers 411.
    let result = engine.handle_message(1, None, None, None).await;
    let MessageResult::Response(response) = result else {
        panic!();
    };
    assert_eq!(response["error_code"], json!(411));

    // configure echoes the settings, keyframe interval taken as-is.
    let result = engine
        .handle_message(
            1,
            None,
            Some(json!({
                "request": "configure",
                "video-bitrate-max": 512_000,
                "video-keyframe-interval": 5_000,
            })),
            None,
        )
        .await;
    let MessageResult::Response(response) = result else {
        panic!();
    };
    assert_eq!(response["settings"]["video-bitrate-max"], json!(512_000));
    assert_eq!(response["settings"]["video-keyframe-interval"], json!(5_000));

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_update_picks_up_manual_descriptor() {
    let dir = temp_dir("engine-update");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    // Drop a capture and its descriptor in by hand.
    let mut writer = crate::mjr::writer::MjrWriter::new(&dir, "opus", false, "manual-audio");
    for i in 0u16..3 {
        writer
            .save_frame(&rtp_packet(111, i, i as u32 * 960, 0x7777, &[0x44; 20]))
            .unwrap();
    }
    writer.close().unwrap();
    std::fs::write(
        dir.join("31337.nfo"),
        "[31337]\r\nname = Manual\r\ndate = 2024-03-03 10:00:00\r\naudio = manual-audio.mjr\r\n",
    )
    .unwrap();

    let result = engine
        .handle_message(1, None, Some(json!({"request": "update"})), None)
        .await;
    assert_eq!(result, MessageResult::Response(json!({"transcode": "ok"})));

    let result = engine
        .handle_message(1, None, Some(json!({"request": "list"})), None)
        .await;
    let MessageResult::Response(response) = result else {
        panic!();
    };
    let list = response["list"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], json!(31337));
    assert_eq!(list[0]["name"], json!("Manual"));

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_simulcast_capture_selects_one_substream() {
    let dir = temp_dir("engine-simulcast");
    let gateway = Arc::new(MockGateway::default());
    let engine = new_engine(&dir, gateway.clone()).await;
    engine.create_session(1).await;

    engine
        .handle_message(
            1,
            None,
            Some(json!({"request": "transcode", "name": "layers", "id": 8})),
            Some(json!({
                "type": "offer",
                "sdp": VIDEO_OFFER,
                "simulcast": { "ssrcs": [100, 200, 300] },
            })),
        )
        .await;
    let (_, event, _) = wait_event(&gateway).await;
    assert_eq!(event["result"]["status"], json!("transcoding"));
    engine.setup_media(1).await;

    // A VP8 keyframe payload on each substream; only the target (substream
    // 2, SSRC 300) may reach the capture.
    let keyframe = [0x10u8, 0x00, 0xAA, 0xBB];
    let delta = [0x10u8, 0x01, 0xAA, 0xBB];
    engine
        .incoming_rtp(1, true, &rtp_packet(96, 1, 3000, 100, &keyframe))
        .await;
    engine
        .incoming_rtp(1, true, &rtp_packet(96, 11, 3000, 200, &keyframe))
        .await;
    engine
        .incoming_rtp(1, true, &rtp_packet(96, 21, 3000, 300, &keyframe))
        .await;
    engine
        .incoming_rtp(1, true, &rtp_packet(96, 22, 6000, 300, &delta))
        .await;
    engine
        .incoming_rtp(1, true, &rtp_packet(96, 2, 6000, 100, &delta))
        .await;
    engine.hangup_media(1).await;

    // The capture holds exactly the substream-2 packets, under one SSRC.
    let index = crate::mjr::index::FrameIndex::parse(&dir, "rec-8-video").unwrap();
    assert_eq!(index.len(), 2);
    let raw = std::fs::read(dir.join("rec-8-video.mjr")).unwrap();
    let mut ssrcs = std::collections::HashSet::new();
    for node in index.iter() {
        let at = node.offset as usize;
        ssrcs.insert(u32::from_be_bytes([
            raw[at + 8],
            raw[at + 9],
            raw[at + 10],
            raw[at + 11],
        ]));
    }
    assert_eq!(ssrcs.len(), 1);
    // The stable output SSRC is none of the wire SSRCs.
    assert!(!ssrcs.contains(&100) && !ssrcs.contains(&200) && !ssrcs.contains(&300));

    engine.close().await;
    std::fs::remove_dir_all(&dir).unwrap();
}
