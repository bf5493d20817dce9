//! Session-description processing and manipulation
//!
//! Two directions, both pure transformations over the external SDP parser's
//! data model:
//!
//! * [`process`] ingests a description received *from the plain peer* and
//!   derives the session's media state from it (remote endpoints, SRTP
//!   keys, direction flags, negotiated codecs).
//! * [`manipulate`] rewrites a description *for the plain peer*: advertised
//!   connection address, local ports, `RTP/AVP`/`RTP/SAVP` transport and,
//!   when SDES is on, the local crypto line.

use std::io::Cursor;

use sdp::description::common::{Address, Attribute, ConnectionInformation};
use sdp::description::media::MediaDescription;
use sdp::description::session::SessionDescription;
use tracing::{debug, warn};

use crate::protocols::srtp::{SrtpContext, SrtpProfile};
use crate::services::session::MediaSession;
use crate::{Error, Result};

pub fn parse(text: &str) -> Result<SessionDescription> {
    SessionDescription::unmarshal(&mut Cursor::new(text.as_bytes()))
        .map_err(|e| Error::missing_sdp(format!("Error parsing SDP: {e}")))
}

fn is_audio(m: &MediaDescription) -> bool {
    m.media_name.media.eq_ignore_ascii_case("audio")
}

fn is_video(m: &MediaDescription) -> bool {
    m.media_name.media.eq_ignore_ascii_case("video")
}

fn media_port(m: &MediaDescription) -> u16 {
    u16::try_from(m.media_name.port.value).unwrap_or(0)
}

fn proto_token(m: &MediaDescription) -> String {
    m.media_name.protos.join("/")
}

fn connection_address(ci: &Option<ConnectionInformation>) -> Option<String> {
    ci.as_ref()
        .and_then(|ci| ci.address.as_ref())
        .map(|a| a.address.clone())
}

/// Parse an `a=crypto` value: `<tag> <suite> inline:<key material>`.
/// Anything not shaped like those three fields is ignored by the caller.
fn parse_crypto_attribute(value: &str) -> Option<(i32, &str, &str)> {
    let mut fields = value.split_whitespace();
    let tag = fields.next()?.parse().ok()?;
    let suite = fields.next()?;
    let key = fields.next()?.strip_prefix("inline:")?;
    Some((tag, suite, key))
}

/// Find the id a header extension URI was mapped to, -1 when absent.
pub fn header_extension_id(desc: &SessionDescription, uri: &str) -> i32 {
    for m in &desc.media_descriptions {
        for attr in &m.attributes {
            if !attr.key.eq_ignore_ascii_case("extmap") {
                continue;
            }
            let Some(value) = attr.value.as_deref() else {
                continue;
            };
            let Some((id_part, ext_uri)) = value.split_once(' ') else {
                continue;
            };
            if ext_uri.trim() != uri {
                continue;
            }
            // The id may carry a direction suffix, e.g. "2/recvonly".
            let id_part = id_part.split('/').next().unwrap_or(id_part);
            if let Ok(id) = id_part.parse() {
                return id;
            }
        }
    }
    -1
}

/// Payload type mapped to RFC 2198 audio redundancy, -1 when absent.
pub fn opusred_payload_type(desc: &SessionDescription) -> i32 {
    for m in &desc.media_descriptions {
        if !is_audio(m) {
            continue;
        }
        for attr in &m.attributes {
            if !attr.key.eq_ignore_ascii_case("rtpmap") {
                continue;
            }
            let Some(value) = attr.value.as_deref() else {
                continue;
            };
            if let Some((pt, codec)) = value.split_once(' ') {
                if codec.to_ascii_lowercase().starts_with("red/48000") {
                    if let Ok(pt) = pt.parse() {
                        return pt;
                    }
                }
            }
        }
    }
    -1
}

/// Resolve the codec name for a payload type: rtpmap first, then the
/// well-known static assignments.
pub fn codec_name(m: &MediaDescription, pt: i32) -> Option<String> {
    for attr in &m.attributes {
        if !attr.key.eq_ignore_ascii_case("rtpmap") {
            continue;
        }
        let Some(value) = attr.value.as_deref() else {
            continue;
        };
        let Some((map_pt, codec)) = value.split_once(' ') else {
            continue;
        };
        if map_pt.parse() == Ok(pt) {
            let name = codec.split('/').next().unwrap_or(codec);
            return Some(name.to_ascii_lowercase());
        }
    }
    match pt {
        0 => Some("pcmu".into()),
        3 => Some("gsm".into()),
        4 => Some("g723".into()),
        8 => Some("pcma".into()),
        9 => Some("g722".into()),
        15 => Some("g728".into()),
        18 => Some("g729".into()),
        26 => Some("jpeg".into()),
        31 => Some("h261".into()),
        34 => Some("h263".into()),
        _ => None,
    }
}

/// On answers, record the payload type the negotiation settled on. When the
/// top entry is the RED payload, the primary codec is the next one in the
/// format list.
fn capture_negotiated_pt(media: &mut MediaSession, m: &MediaDescription, opusred_pt: i32) {
    let video = is_video(m);
    let formats = &m.media_name.formats;
    let pt: i32 = match formats.first().and_then(|f| f.parse().ok()) {
        Some(pt) => pt,
        None => return,
    };
    if video {
        media.video.pt = pt;
        media.video.pt_name = codec_name(m, pt);
    } else {
        if pt == opusred_pt && opusred_pt != -1 {
            media.opusred_pt = pt;
            media.audio.pt = formats.get(1).and_then(|f| f.parse().ok()).unwrap_or(-1);
        } else {
            media.audio.pt = pt;
        }
        media.audio.pt_name = codec_name(m, media.audio.pt);
    }
}

/// Ingest a description received from the plain peer.
///
/// Returns whether an endpoint changed relative to the current session
/// state; on updates the caller marks the session `updated` and wakes the
/// relay so sockets get reconnected.
pub fn process(
    media: &mut MediaSession,
    desc: &SessionDescription,
    answer: bool,
    update: bool,
) -> bool {
    let mut changed = false;
    let opusred_pt = if answer { opusred_payload_type(desc) } else { -1 };

    if let Some(addr) = connection_address(&desc.connection_information) {
        if update
            && (media.remote_audio_ip.as_deref() != Some(addr.as_str())
                || media.remote_video_ip.as_deref() != Some(addr.as_str()))
        {
            changed = true;
        }
        // The session-level address seeds both media; a media-level c= below
        // overrides it per medium.
        media.remote_audio_ip = Some(addr.clone());
        media.remote_video_ip = Some(addr);
    }

    for m in &desc.media_descriptions {
        if proto_token(m).eq_ignore_ascii_case("RTP/SAVP") {
            media.require_srtp = true;
        }
        let video = is_video(m);
        if !video && !is_audio(m) {
            warn!("Unsupported media line (not audio/video): {}", m.media_name.media);
            continue;
        }

        let port = media_port(m);
        if port != 0 {
            let stream = media.stream_mut(video);
            if port != stream.remote_rtp_port {
                changed = true;
            }
            stream.active = true;
            stream.remote_rtp_port = port;
            // No attempt to parse a=rtcp; the next port is assumed.
            stream.remote_rtcp_port = port + 1;
            stream.send_enabled = !m.attributes.iter().any(|a| {
                a.key.eq_ignore_ascii_case("sendonly") || a.key.eq_ignore_ascii_case("inactive")
            });
        } else {
            media.stream_mut(video).send_enabled = false;
        }

        if let Some(addr) = connection_address(&m.connection_information) {
            let current = media.remote_ip(video);
            if update && current != Some(addr.as_str()) {
                changed = true;
            }
            if video {
                media.remote_video_ip = Some(addr);
            } else {
                media.remote_audio_ip = Some(addr);
            }
        }

        for attr in &m.attributes {
            if attr.key.eq_ignore_ascii_case("crypto") {
                if media.stream(video).srtp_in.is_some() {
                    // Remote SRTP is already set for this medium.
                    continue;
                }
                let Some(value) = attr.value.as_deref() else {
                    continue;
                };
                let Some((tag, suite, key)) = parse_crypto_attribute(value) else {
                    warn!("Failed to parse crypto line, ignoring... {value}");
                    continue;
                };
                if answer && tag != media.stream(video).srtp_tag {
                    // Not the tag for the crypto line we offered.
                    continue;
                }
                let Some(profile) = SrtpProfile::from_name(suite) else {
                    warn!("Unsupported SRTP profile {suite}");
                    continue;
                };
                match SrtpContext::new_inbound(profile, key) {
                    Ok(context) => {
                        let stream = media.stream_mut(video);
                        stream.srtp_in = Some(context);
                        stream.srtp_tag = tag;
                        media.srtp_profile = Some(profile);
                        media.has_srtp_remote = true;
                        debug!(
                            "{} inbound SRTP context created ({})",
                            if video { "Video" } else { "Audio" },
                            profile.name()
                        );
                    }
                    Err(e) => {
                        warn!("Ignoring crypto line: {e}");
                    }
                }
            } else if video && attr.key.eq_ignore_ascii_case("rtcp-fb") {
                if attr.value.as_deref().is_some_and(|v| v.contains(" pli")) {
                    media.video_pli_supported = true;
                }
            }
        }

        if answer {
            capture_negotiated_pt(media, m, opusred_pt);
        }
    }

    if update && changed {
        media.updated = true;
    }
    changed
}

/// Rewrite a description into the plain-RTP view advertised to the peer and
/// render it.
pub fn manipulate(
    media: &mut MediaSession,
    desc: &mut SessionDescription,
    answer: bool,
    advertised_ip: &str,
) -> Result<String> {
    let connection = ConnectionInformation {
        network_type: "IN".to_string(),
        address_type: if advertised_ip.contains(':') { "IP6" } else { "IP4" }.to_string(),
        address: Some(Address {
            address: advertised_ip.to_string(),
            ttl: None,
            range: None,
        }),
    };
    desc.connection_information = Some(connection.clone());

    let proto: Vec<String> = if media.require_srtp {
        vec!["RTP".into(), "SAVP".into()]
    } else {
        vec!["RTP".into(), "AVP".into()]
    };
    debug!("Setting protocol to {}", proto.join("/"));

    let opusred_pt = if answer { opusred_payload_type(desc) } else { -1 };
    let mut captures: Vec<(usize, i32)> = Vec::new();

    for (index, m) in desc.media_descriptions.iter_mut().enumerate() {
        m.media_name.protos = proto.clone();
        let video = is_video(m);
        if video || is_audio(m) {
            let stream = media.stream_mut(video);
            m.media_name.port.value = stream.local_rtp_port as isize;
            if media.has_srtp_local {
                let profile = media.srtp_profile.unwrap_or(SrtpProfile::AesCm128HmacSha1_80);
                let stream = media.stream_mut(video);
                if stream.srtp_local_profile.is_none() || stream.srtp_local_crypto.is_none() {
                    let (context, crypto) = SrtpContext::new_outbound(profile)?;
                    stream.srtp_out = Some(context);
                    stream.srtp_local_profile = Some(profile.name().to_string());
                    stream.srtp_local_crypto = Some(crypto);
                }
                if stream.srtp_tag == 0 {
                    stream.srtp_tag = 1;
                }
                m.attributes.push(Attribute::new(
                    "crypto".to_string(),
                    Some(format!(
                        "{} {} inline:{}",
                        stream.srtp_tag,
                        stream.srtp_local_profile.as_deref().unwrap_or_default(),
                        stream.srtp_local_crypto.as_deref().unwrap_or_default(),
                    )),
                ));
            }
            if answer {
                captures.push((index, opusred_pt));
            }
        }
        m.connection_information = Some(connection.clone());
    }

    for (index, opusred_pt) in captures {
        let m = &desc.media_descriptions[index];
        capture_negotiated_pt(media, m, opusred_pt);
    }

    Ok(desc.marshal())
}
