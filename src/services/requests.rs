//! Asynchronous request handling
//!
//! Every request accepted by the plugin is queued and drained by a single
//! worker task, so per-session request order is preserved and no two
//! requests ever mutate the same session concurrently. Responses travel
//! back through the host's `push_event` upcall.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::host::{HostCallbacks, Jsep, SessionHandle};
use crate::protocols::sdp;
use crate::protocols::srtp::SrtpProfile;
use crate::protocols::rtp::{EXTMAP_AUDIO_LEVEL, EXTMAP_VIDEO_ORIENTATION};
use crate::services::ports::PortAllocator;
use crate::services::recording::Recorder;
use crate::services::relay;
use crate::services::session::{MediaSession, Session, SessionRegistry};
use crate::{Error, Result};

/// A request waiting for the worker, exactly as the host handed it over.
pub struct PendingRequest {
    pub handle: SessionHandle,
    pub transaction: String,
    pub message: Option<Value>,
    pub jsep: Option<Jsep>,
}

pub enum WorkerMessage {
    Request(PendingRequest),
    Exit,
}

/// Everything the request handlers need besides the session itself.
pub struct RequestContext {
    pub host: Arc<dyn HostCallbacks>,
    pub registry: Arc<SessionRegistry>,
    pub ports: Arc<PortAllocator>,
    /// Address advertised in rewritten descriptions.
    pub advertised_ip: String,
    /// Config-level gate for event notifications.
    pub notify_events: bool,
    pub recordings_dir: Option<PathBuf>,
}

impl RequestContext {
    fn events_enabled(&self) -> bool {
        self.notify_events && self.host.events_is_enabled()
    }
}

/// Drain the request queue until an exit message arrives.
pub async fn run_worker(
    ctx: Arc<RequestContext>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    debug!("Joining request worker");
    while let Some(message) = rx.recv().await {
        let request = match message {
            WorkerMessage::Exit => break,
            WorkerMessage::Request(request) => request,
        };
        let Some(session) = ctx.registry.get(request.handle) else {
            error!("No session associated with handle {}", request.handle);
            continue;
        };
        if session.is_destroyed() {
            continue;
        }
        match handle_request(&ctx, &session, &request).await {
            Ok((result, jsep)) => {
                let event = json!({ "nosip": "event", "result": result });
                ctx.host.push_event(request.handle, &request.transaction, event, jsep);
            }
            Err(e) => {
                let event = json!({
                    "nosip": "event",
                    "error_code": e.code(),
                    "error": e.to_string(),
                });
                ctx.host.push_event(request.handle, &request.transaction, event, None);
            }
        }
    }
    debug!("Leaving request worker");
}

fn parse_params<T: DeserializeOwned>(message: &Value) -> Result<T> {
    serde_json::from_value(message.clone()).map_err(|e| {
        let text = e.to_string();
        if text.contains("missing field") {
            Error::MissingElement(text)
        } else {
            Error::invalid_element(text)
        }
    })
}

#[derive(Debug, Deserialize)]
struct GenerateParams {
    info: Option<String>,
    srtp: Option<String>,
    srtp_profile: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessParams {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
    info: Option<String>,
    srtp: Option<String>,
    srtp_profile: Option<String>,
    #[serde(default)]
    update: bool,
}

#[derive(Debug, Deserialize)]
struct RecordingParams {
    action: String,
    #[serde(default)]
    audio: bool,
    #[serde(default)]
    video: bool,
    #[serde(default)]
    peer_audio: bool,
    #[serde(default)]
    peer_video: bool,
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyframeParams {
    #[serde(default)]
    user: bool,
    #[serde(default)]
    peer: bool,
}

/// Dispatch one request and produce the result payload plus an optional
/// WebRTC-side description to push along with it.
pub(crate) async fn handle_request(
    ctx: &RequestContext,
    session: &Arc<Session>,
    request: &PendingRequest,
) -> Result<(Value, Option<Jsep>)> {
    let message = request.message.as_ref().ok_or(Error::NoMessage)?;
    if !message.is_object() {
        return Err(Error::InvalidJson("Not an object".to_string()));
    }
    let request_value = message
        .get("request")
        .ok_or_else(|| Error::MissingElement("Missing mandatory element (request)".to_string()))?;
    let request_text = request_value
        .as_str()
        .ok_or_else(|| Error::invalid_element("Invalid element type (request should be a string)"))?;

    match request_text.to_ascii_lowercase().as_str() {
        "generate" => handle_negotiation(ctx, session, request, true).await,
        "process" => handle_negotiation(ctx, session, request, false).await,
        "hangup" => {
            ctx.host.close_pc(session.handle);
            Ok((json!({ "event": "hangingup" }), None))
        }
        "recording" => handle_recording(ctx, session, message).await,
        "keyframe" => handle_keyframe(ctx, session, message).await,
        other => Err(Error::invalid_request(format!("Unknown request ({other})"))),
    }
}

fn parse_srtp_option(srtp: Option<&str>) -> Result<(bool, bool)> {
    match srtp {
        None => Ok((false, false)),
        Some(s) if s.eq_ignore_ascii_case("sdes_optional") => Ok((true, false)),
        Some(s) if s.eq_ignore_ascii_case("sdes_mandatory") => Ok((true, true)),
        Some(_) => Err(Error::invalid_element(
            "Invalid element (srtp can only be sdes_optional or sdes_mandatory)",
        )),
    }
}

fn parse_srtp_profile(profile: Option<&str>) -> Result<SrtpProfile> {
    match profile {
        None => Ok(SrtpProfile::AesCm128HmacSha1_80),
        Some("AES_CM_128_HMAC_SHA1_32") => Ok(SrtpProfile::AesCm128HmacSha1_32),
        Some("AES_CM_128_HMAC_SHA1_80") => Ok(SrtpProfile::AesCm128HmacSha1_80),
        Some("AEAD_AES_128_GCM") => Ok(SrtpProfile::AeadAes128Gcm),
        Some("AEAD_AES_256_GCM") => Ok(SrtpProfile::AeadAes256Gcm),
        Some(_) => Err(Error::invalid_element(
            "Invalid element (unsupported SRTP profile)",
        )),
    }
}

/// Pull the base-layer SSRC out of a simulcast description. The shape is
/// permissive: `ssrcs` may be an array (first entry wins) or an object with
/// an `ssrc-0` field, whichever is present.
fn simulcast_base_ssrc(simulcast: &Value) -> Option<u32> {
    let first = simulcast.as_array()?.first()?;
    let ssrcs = first.get("ssrcs")?;
    let mut base = ssrcs
        .as_array()
        .and_then(|list| list.first())
        .and_then(Value::as_u64);
    if let Some(v) = ssrcs.get("ssrc-0").and_then(Value::as_u64) {
        base = Some(v);
    }
    base.map(|v| v as u32)
}

fn allocate_local_ports(
    media: &mut MediaSession,
    ports: &PortAllocator,
    update: bool,
) -> Result<()> {
    if !update {
        for video in [false, true] {
            let stream = media.stream_mut(video);
            stream.rtp_socket = None;
            stream.rtcp_socket = None;
            stream.local_rtp_port = 0;
            stream.local_rtcp_port = 0;
            stream.ssrc = 0;
        }
    }
    for video in [false, true] {
        let stream = media.stream_mut(video);
        if !stream.active || (stream.local_rtp_port != 0 && stream.local_rtcp_port != 0) {
            continue;
        }
        let pair = ports.allocate_pair(video)?;
        debug!(
            "{} RTP/RTCP listeners bound to ports {}/{}",
            if video { "Video" } else { "Audio" },
            pair.rtp_port,
            pair.rtcp_port
        );
        let stream = media.stream_mut(video);
        stream.rtp_socket = Some(pair.rtp_socket);
        stream.rtcp_socket = Some(pair.rtcp_socket);
        stream.local_rtp_port = pair.rtp_port;
        stream.local_rtcp_port = pair.rtcp_port;
    }
    if update {
        // The relay must pick up the refreshed endpoints.
        media.updated = true;
    }
    Ok(())
}

async fn handle_negotiation(
    ctx: &RequestContext,
    session: &Arc<Session>,
    request: &PendingRequest,
    generate: bool,
) -> Result<(Value, Option<Jsep>)> {
    let message = request.message.as_ref().ok_or(Error::NoMessage)?;

    let (sdp_type, sdp_text, mut update, info, srtp, srtp_profile);
    if generate {
        let params: GenerateParams = parse_params(message)?;
        let jsep = request
            .jsep
            .as_ref()
            .ok_or_else(|| Error::missing_sdp("Missing SDP"))?;
        sdp_type = jsep.kind.clone();
        sdp_text = jsep.sdp.clone();
        update = jsep.update;
        info = params.info;
        srtp = params.srtp;
        srtp_profile = params.srtp_profile;
    } else {
        let params: ProcessParams = parse_params(message)?;
        sdp_type = params.kind;
        sdp_text = params.sdp;
        update = params.update;
        info = params.info;
        srtp = params.srtp;
        srtp_profile = params.srtp_profile;
    }

    let offer = sdp_type.eq_ignore_ascii_case("offer");
    if !offer && !sdp_type.eq_ignore_ascii_case("answer") {
        return Err(Error::missing_sdp("Missing or invalid SDP type"));
    }
    if sdp_text.contains("m=application") {
        return Err(Error::missing_sdp("Data channels are not bridged to plain RTP peers"));
    }
    if request.jsep.as_ref().is_some_and(|j| j.e2ee) {
        // Media is encrypted end-to-end, but the plain peer needs frames in
        // the clear.
        return Err(Error::invalid_element("Media encryption unsupported by this plugin"));
    }
    if let Some(info) = &info {
        debug!("[{}] Request context: {info}", session.id);
    }

    let (mut do_srtp, require_srtp) = parse_srtp_option(srtp.as_deref())?;
    // Parse before touching any session state.
    let mut desc = sdp::parse(&sdp_text)?;

    let mut media = session.media.lock().await;
    if !generate && media.ready {
        // A description arriving on an established session is implicitly
        // an update.
        update = true;
    }
    if offer && !update {
        // Fresh negotiation: forget any SRTP state from a previous one.
        media.srtp_cleanup();
        if do_srtp {
            debug!(
                "Going to negotiate SDES-SRTP ({})...",
                if require_srtp { "mandatory" } else { "optional" }
            );
        }
    }
    media.require_srtp = require_srtp;

    if generate {
        if !offer {
            do_srtp = do_srtp || media.has_srtp_remote;
            if media.require_srtp && !media.has_srtp_remote {
                return Err(Error::too_strict(
                    "Can't generate answer: SDES-SRTP required, but caller didn't offer it",
                ));
            }
        }
        media.has_srtp_local = do_srtp;
        if do_srtp {
            media.srtp_profile = Some(parse_srtp_profile(srtp_profile.as_deref())?);
        }
    }

    // Cache the header-extension ids the WebRTC side negotiated.
    media.video_orientation_extension_id = sdp::header_extension_id(&desc, EXTMAP_VIDEO_ORIENTATION);
    media.audio_level_extension_id = sdp::header_extension_id(&desc, EXTMAP_AUDIO_LEVEL);

    let result;
    let mut local_jsep = None;
    if generate {
        for m in &desc.media_descriptions {
            let port = m.media_name.port.value;
            if m.media_name.media.eq_ignore_ascii_case("audio") && port != 0 {
                debug!("Going to negotiate audio...");
                media.audio.active = true;
            } else if m.media_name.media.eq_ignore_ascii_case("video") && port != 0 {
                debug!("Going to negotiate video...");
                media.video.active = true;
            }
        }
        allocate_local_ports(&mut media, &ctx.ports, update)
            .map_err(|_| Error::network("Could not allocate RTP/RTCP ports"))?;

        let rendered = sdp::manipulate(&mut media, &mut desc, !offer, &ctx.advertised_ip)?;
        info!("Prepared {} for the peer", sdp_type);

        // The user may have negotiated simulcast; stick to the base layer.
        if let Some(simulcast) = request.jsep.as_ref().and_then(|j| j.simulcast.as_ref()) {
            warn!("Client negotiated simulcasting which we don't do here, falling back to base substream...");
            if let Some(ssrc) = simulcast_base_ssrc(simulcast) {
                media.simulcast_ssrc = ssrc;
            }
        }

        {
            let mut stored = session.sdp.lock().await;
            stored.description = Some(desc);
            stored.version += 1;
        }
        session.set_hanging_up(false);

        if !update && ctx.events_enabled() {
            ctx.host.notify_event(
                session.handle,
                json!({
                    "event": "generated",
                    "type": if offer { "offer" } else { "answer" },
                    "sdp": &rendered,
                }),
            );
        }

        let mut event = json!({
            "event": "generated",
            "type": if offer { "offer" } else { "answer" },
            "sdp": rendered,
        });
        if update {
            event["update"] = json!(true);
        }
        result = event;
    } else {
        let changed = sdp::process(&mut media, &desc, !offer, update);
        if !media.audio.active && !media.video.active {
            return Err(Error::invalid_sdp("No audio and no video being negotiated"));
        }
        if media.remote_audio_ip.is_none() && media.remote_video_ip.is_none() {
            return Err(Error::invalid_sdp("No remote IP addresses"));
        }
        if media.require_srtp && !media.has_srtp_remote {
            return Err(Error::too_strict(
                "Can't process request: SDES-SRTP required, but caller didn't offer it",
            ));
        }
        {
            let mut stored = session.sdp.lock().await;
            stored.description = Some(desc);
            stored.version += 1;
        }
        if update && changed {
            // Wake the relay so it reconnects to the new endpoints.
            session.wake.notify_one();
        }

        if !update && ctx.events_enabled() {
            ctx.host.notify_event(
                session.handle,
                json!({
                    "event": "processed",
                    "type": if offer { "offer" } else { "answer" },
                    "sdp": &sdp_text,
                }),
            );
        }

        let mut event = json!({ "event": "processed" });
        if media.has_srtp_remote {
            event["srtp"] = json!(if media.require_srtp {
                "sdes_mandatory"
            } else {
                "sdes_optional"
            });
        }
        if update {
            event["update"] = json!(true);
        }
        result = event;
        // Hand the plain description back as the WebRTC-side one.
        local_jsep = Some(Jsep::new(&sdp_type, sdp_text));
    }

    // An answer settles the negotiation: start bridging.
    if !update && !offer {
        media.ready = true;
        drop(media);
        if !session.relay_running() {
            session.set_relay_running(true);
            tokio::spawn(relay::relay_task(Arc::clone(session), Arc::clone(&ctx.host)));
        }
    }

    Ok((result, local_jsep))
}

async fn handle_recording(
    ctx: &RequestContext,
    session: &Arc<Session>,
    message: &Value,
) -> Result<(Value, Option<Jsep>)> {
    let params: RecordingParams = parse_params(message)?;
    let start = match params.action.to_ascii_lowercase().as_str() {
        "start" => true,
        "stop" => false,
        _ => return Err(Error::invalid_element("Invalid action (should be start|stop)")),
    };
    if !params.audio && !params.video && !params.peer_audio && !params.peer_video {
        return Err(Error::recording(
            "Invalid request (at least one of audio, video, peer_audio and peer_video should be true)",
        ));
    }

    if start {
        let (audio_codec, video_codec, opusred_pt) = {
            let media = session.media.lock().await;
            (
                media.audio.pt_name.clone(),
                media.video.pt_name.clone(),
                media.opusred_pt,
            )
        };
        let now = Utc::now().timestamp_micros();
        let dir = ctx.recordings_dir.as_deref();
        let mut recorders = session.recorders.lock().await;

        let targets = [
            (params.peer_audio, false, true),
            (params.peer_video, true, true),
            (params.audio, false, false),
            (params.video, true, false),
        ];
        for (enabled, video, peer) in targets {
            if !enabled {
                continue;
            }
            let slot = match (video, peer) {
                (false, true) => &mut recorders.peer_audio,
                (true, true) => &mut recorders.peer_video,
                (false, false) => &mut recorders.user_audio,
                (true, false) => &mut recorders.user_video,
            };
            if slot.is_some() {
                continue;
            }
            let codec = if video { &video_codec } else { &audio_codec };
            let Some(codec) = codec.as_deref() else {
                // Nothing negotiated for this medium yet.
                warn!(
                    "Couldn't start {} {} recording, no negotiated codec",
                    if peer { "peer" } else { "user" },
                    if video { "video" } else { "audio" }
                );
                continue;
            };
            let suffix = match (video, peer) {
                (false, true) => "peer-audio",
                (true, true) => "peer-video",
                (false, false) => "user-audio",
                (true, false) => "user-video",
            };
            let filename = match &params.filename {
                Some(base) => format!("{base}-{suffix}"),
                None => format!("bridge-{}-{now}-{suffix}", session.id),
            };
            match Recorder::create(dir, codec, &filename) {
                Ok(mut recorder) => {
                    info!(
                        "Starting recording of {}'s {} ({filename})",
                        if peer { "peer" } else { "user" },
                        if video { "video" } else { "audio" }
                    );
                    if !video && opusred_pt > 0 {
                        recorder.set_opusred(opusred_pt);
                    }
                    *slot = Some(recorder);
                    if video && !peer {
                        // Ask for a keyframe so the recording starts decodable.
                        debug!("Recording video, sending a PLI to kickstart it");
                        ctx.host.send_pli(session.handle);
                    }
                }
                Err(e) => {
                    error!("Couldn't open recording file {filename}: {e}");
                }
            }
        }
    } else {
        let mut recorders = session.recorders.lock().await;
        recorders.close(params.audio, params.peer_audio, params.video, params.peer_video);
    }

    Ok((json!({ "event": "recordingupdated" }), None))
}

async fn handle_keyframe(
    ctx: &RequestContext,
    session: &Arc<Session>,
    message: &Value,
) -> Result<(Value, Option<Jsep>)> {
    let params: KeyframeParams = parse_params(message)?;
    if params.user {
        // Keyframe request towards the WebRTC side.
        ctx.host.send_pli(session.handle);
    }
    if params.peer {
        // Keyframe request towards the peer, but only if it advertised PLI.
        let supported = session.media.lock().await.video_pli_supported;
        if supported {
            relay::send_peer_pli(session).await;
        }
    }
    Ok((json!({ "event": "keyframesent" }), None))
}
