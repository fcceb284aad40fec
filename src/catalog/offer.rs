//! SDP helpers: the sendonly offer cached on each completed capture, the
//! recvonly answer returned to a capturing peer, and codec selection out of
//! a client offer.

use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use sdp::description::common::{Address, ConnectionInformation};
use sdp::description::media::{MediaDescription, MediaName, RangedPort};
use sdp::description::session::{Origin, SessionDescription, TimeDescription, Timing};

use crate::codec::{AudioCodec, VideoCodec, AUDIO_PREFERENCES, VIDEO_PREFERENCES};
use crate::error::Result;

const OFFER_ADDRESS: &str = "1.1.1.1";

pub fn parse_sdp(raw: &str) -> Result<SessionDescription> {
    Ok(SessionDescription::unmarshal(&mut Cursor::new(raw))?)
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn origin(session_id: u64, session_version: u64) -> Origin {
    Origin {
        username: "-".to_owned(),
        session_id,
        session_version,
        network_type: "IN".to_owned(),
        address_type: "IP4".to_owned(),
        unicast_address: OFFER_ADDRESS.to_owned(),
    }
}

fn connection() -> Option<ConnectionInformation> {
    Some(ConnectionInformation {
        network_type: "IN".to_owned(),
        address_type: "IP4".to_owned(),
        address: Some(Address {
            address: OFFER_ADDRESS.to_owned(),
            ttl: None,
            range: None,
        }),
    })
}

fn media(kind: &str, pt: u8, rtpmap: String, direction: &str, mid: &str) -> MediaDescription {
    MediaDescription {
        media_name: MediaName {
            media: kind.to_owned(),
            port: RangedPort {
                value: 9,
                range: None,
            },
            protos: vec![
                "UDP".to_owned(),
                "TLS".to_owned(),
                "RTP".to_owned(),
                "SAVPF".to_owned(),
            ],
            formats: vec![pt.to_string()],
        },
        connection_information: connection(),
        ..Default::default()
    }
    .with_value_attribute("mid".to_owned(), mid.to_owned())
    .with_value_attribute("rtpmap".to_owned(), rtpmap)
    .with_property_attribute(direction.to_owned())
    .with_property_attribute("rtcp-mux".to_owned())
}

fn audio_rtpmap(pt: u8, codec: AudioCodec) -> String {
    if codec.channels() > 1 {
        format!(
            "{pt} {}/{}/{}",
            codec.rtpmap_name(),
            codec.clock_rate(),
            codec.channels()
        )
    } else {
        format!("{pt} {}/{}", codec.rtpmap_name(), codec.clock_rate())
    }
}

fn video_rtpmap(pt: u8, codec: VideoCodec) -> String {
    format!("{pt} {}/{}", codec.rtpmap_name(), codec.clock_rate())
}

/// Builds the sendonly offer advertised to viewers of a capture.
pub fn generate_offer(
    id: u64,
    audio: Option<(AudioCodec, u8)>,
    video: Option<(VideoCodec, u8)>,
) -> Result<String> {
    let mut sdp = SessionDescription {
        version: 0,
        origin: origin(unix_micros(), 1),
        session_name: format!("Capture {id}"),
        time_descriptions: vec![TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: vec![],
        }],
        ..Default::default()
    };
    if let Some((codec, pt)) = audio {
        sdp = sdp.with_media(media(
            "audio",
            pt,
            audio_rtpmap(pt, codec),
            "sendonly",
            "audio",
        ));
    }
    if let Some((codec, pt)) = video {
        sdp = sdp.with_media(media(
            "video",
            pt,
            video_rtpmap(pt, codec),
            "sendonly",
            "video",
        ));
    }
    Ok(sdp.marshal())
}

/// Rewrites the o= session id/version of a cached offer, for renegotiations.
pub fn rewrite_origin(raw: &str, session_id: u64, session_version: u64) -> Result<String> {
    let mut sdp = parse_sdp(raw)?;
    sdp.origin.session_id = session_id;
    sdp.origin.session_version = session_version;
    Ok(sdp.marshal())
}

struct RtpMapEntry {
    pt: u8,
    encoding: String,
}

fn rtpmaps(m: &MediaDescription) -> Vec<RtpMapEntry> {
    let mut maps = vec![];
    for a in &m.attributes {
        if a.key != "rtpmap" {
            continue;
        }
        let Some(value) = &a.value else { continue };
        let Some((pt, rest)) = value.split_once(' ') else {
            continue;
        };
        let Ok(pt) = pt.parse::<u8>() else { continue };
        let encoding = rest.split('/').next().unwrap_or_default().to_lowercase();
        maps.push(RtpMapEntry { pt, encoding });
    }
    maps
}

fn media_direction(m: &MediaDescription) -> Option<&str> {
    for key in ["sendrecv", "sendonly", "recvonly", "inactive"] {
        if m.attribute(key).is_some() {
            return Some(key);
        }
    }
    None
}

/// Picks the codecs we'll capture out of a client offer. An m-line the
/// client marked recvonly carries nothing to record and disables the medium.
pub fn preferred_codecs(offer: &SessionDescription) -> (Option<AudioCodec>, Option<VideoCodec>) {
    let mut audio = None;
    let mut video = None;
    for m in &offer.media_descriptions {
        let direction = media_direction(m);
        if direction == Some("recvonly") || direction == Some("inactive") {
            continue;
        }
        let maps = rtpmaps(m);
        match m.media_name.media.as_str() {
            "audio" if audio.is_none() => {
                audio = AUDIO_PREFERENCES
                    .iter()
                    .find(|c| maps.iter().any(|e| e.encoding == c.name()))
                    .copied();
            }
            "video" if video.is_none() => {
                video = VIDEO_PREFERENCES
                    .iter()
                    .find(|c| maps.iter().any(|e| e.encoding == c.name()))
                    .copied();
            }
            _ => {}
        }
    }
    (audio, video)
}

/// Builds the recvonly answer to a capture offer, mirroring the offered
/// m-lines and reusing the offerer's payload type for the chosen codec.
/// Media we don't accept are answered with a zero port.
pub fn generate_answer(
    offer: &SessionDescription,
    id: u64,
    audio: Option<AudioCodec>,
    video: Option<VideoCodec>,
    session_id: u64,
    session_version: u64,
) -> Result<String> {
    let mut answer = SessionDescription {
        version: 0,
        origin: origin(session_id, session_version),
        session_name: format!("Capture {id}"),
        time_descriptions: vec![TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: vec![],
        }],
        ..Default::default()
    };

    for m in &offer.media_descriptions {
        let kind = m.media_name.media.as_str();
        let mid = m
            .attribute("mid")
            .flatten()
            .unwrap_or(kind)
            .to_owned();
        let maps = rtpmaps(m);
        let accepted = match kind {
            "audio" => audio.and_then(|codec| {
                maps.iter()
                    .find(|e| e.encoding == codec.name())
                    .map(|e| (e.pt, audio_rtpmap(e.pt, codec)))
            }),
            "video" => video.and_then(|codec| {
                maps.iter()
                    .find(|e| e.encoding == codec.name())
                    .map(|e| (e.pt, video_rtpmap(e.pt, codec)))
            }),
            _ => None,
        };
        match accepted {
            Some((pt, rtpmap)) => {
                answer = answer.with_media(media(kind, pt, rtpmap, "recvonly", &mid));
            }
            None => {
                // Rejected m-line: zero port, formats echoed back.
                answer = answer.with_media(MediaDescription {
                    media_name: MediaName {
                        media: kind.to_owned(),
                        port: RangedPort {
                            value: 0,
                            range: None,
                        },
                        protos: m.media_name.protos.clone(),
                        formats: m.media_name.formats.clone(),
                    },
                    connection_information: connection(),
                    ..Default::default()
                });
            }
        }
    }
    Ok(answer.marshal())
}
