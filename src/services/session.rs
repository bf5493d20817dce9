//! Per-session state for the RTP bridge
//!
//! A [`Session`] is created per host handle and shared between the session
//! registry, the request worker and the relay task. Media state lives behind
//! its own mutex, recorders behind a second one so packet paths never
//! contend with request handling for longer than necessary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sdp::description::session::SessionDescription;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::host::SessionHandle;
use crate::protocols::rtp::RtpSwitchingContext;
use crate::protocols::srtp::{SrtpContext, SrtpProfile};
use crate::services::recording::Recorder;

/// State of one medium (audio or video) on the peer leg.
#[derive(Debug, Default)]
pub struct MediaStream {
    /// Whether this medium is part of the negotiation (non-zero port).
    pub active: bool,
    pub rtp_socket: Option<Arc<UdpSocket>>,
    pub rtcp_socket: Option<Arc<UdpSocket>>,
    pub local_rtp_port: u16,
    pub local_rtcp_port: u16,
    pub remote_rtp_port: u16,
    pub remote_rtcp_port: u16,
    /// SSRC of the WebRTC user, learned from the first outbound frame.
    pub ssrc: u32,
    /// SSRC of the plain peer, learned from the first inbound frame.
    pub ssrc_peer: u32,
    /// Negotiated payload type, -1 until an answer fixed it.
    pub pt: i32,
    pub pt_name: Option<String>,
    /// Mirrors the direction attribute: false when the peer declared
    /// sendonly/inactive, so nothing may be forwarded to it.
    pub send_enabled: bool,
    pub srtp_tag: i32,
    pub srtp_in: Option<SrtpContext>,
    pub srtp_out: Option<SrtpContext>,
    pub srtp_local_profile: Option<String>,
    pub srtp_local_crypto: Option<String>,
    pub switching: RtpSwitchingContext,
}

impl MediaStream {
    fn new() -> Self {
        Self {
            pt: -1,
            send_enabled: true,
            ..Default::default()
        }
    }

    fn clear_srtp(&mut self) {
        self.srtp_tag = 0;
        self.srtp_in = None;
        self.srtp_out = None;
        self.srtp_local_profile = None;
        self.srtp_local_crypto = None;
    }

    fn close_sockets(&mut self) {
        self.rtp_socket = None;
        self.rtcp_socket = None;
    }
}

/// Media-bridging state of one session.
#[derive(Debug)]
pub struct MediaSession {
    pub remote_audio_ip: Option<String>,
    pub remote_video_ip: Option<String>,
    /// Both descriptions negotiated and the relay launched.
    pub ready: bool,
    /// Remote endpoints changed; the relay must re-resolve and reconnect.
    pub updated: bool,
    pub require_srtp: bool,
    pub has_srtp_local: bool,
    pub has_srtp_remote: bool,
    pub srtp_profile: Option<SrtpProfile>,
    pub audio: MediaStream,
    pub video: MediaStream,
    /// RED payload type when the negotiated audio uses RFC 2198 redundancy.
    pub opusred_pt: i32,
    /// Base-layer SSRC to keep when the user negotiated simulcast; 0 when
    /// not simulcasting.
    pub simulcast_ssrc: u32,
    pub video_pli_supported: bool,
    pub video_orientation_extension_id: i32,
    pub audio_level_extension_id: i32,
}

impl Default for MediaSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaSession {
    pub fn new() -> Self {
        Self {
            remote_audio_ip: None,
            remote_video_ip: None,
            ready: false,
            updated: false,
            require_srtp: false,
            has_srtp_local: false,
            has_srtp_remote: false,
            srtp_profile: None,
            audio: MediaStream::new(),
            video: MediaStream::new(),
            opusred_pt: -1,
            simulcast_ssrc: 0,
            video_pli_supported: false,
            video_orientation_extension_id: -1,
            audio_level_extension_id: -1,
        }
    }

    pub fn stream(&self, video: bool) -> &MediaStream {
        if video {
            &self.video
        } else {
            &self.audio
        }
    }

    pub fn stream_mut(&mut self, video: bool) -> &mut MediaStream {
        if video {
            &mut self.video
        } else {
            &mut self.audio
        }
    }

    pub fn remote_ip(&self, video: bool) -> Option<&str> {
        if video {
            self.remote_video_ip.as_deref()
        } else {
            self.remote_audio_ip.as_deref()
        }
    }

    /// Drop all SRTP material, both directions and media.
    pub fn srtp_cleanup(&mut self) {
        self.require_srtp = false;
        self.has_srtp_local = false;
        self.has_srtp_remote = false;
        self.srtp_profile = None;
        self.audio.clear_srtp();
        self.video.clear_srtp();
    }

    /// Clear the negotiated media parameters. Sockets and ports survive a
    /// reset; they are only released by [`MediaSession::cleanup`].
    pub fn reset(&mut self) {
        self.remote_audio_ip = None;
        self.remote_video_ip = None;
        self.updated = false;
        self.ready = false;
        self.require_srtp = false;
        self.opusred_pt = -1;
        self.video_pli_supported = false;
        self.video_orientation_extension_id = -1;
        self.audio_level_extension_id = -1;
        for video in [false, true] {
            let stream = self.stream_mut(video);
            stream.active = false;
            stream.pt = -1;
            stream.pt_name = None;
            stream.send_enabled = true;
            stream.switching.reset();
        }
    }

    /// Release everything the media plane holds: sockets, ports, SSRCs,
    /// SRTP state, then the negotiated parameters.
    pub fn cleanup(&mut self) {
        for video in [false, true] {
            let stream = self.stream_mut(video);
            stream.close_sockets();
            stream.local_rtp_port = 0;
            stream.local_rtcp_port = 0;
            stream.remote_rtp_port = 0;
            stream.remote_rtcp_port = 0;
            stream.ssrc = 0;
            stream.ssrc_peer = 0;
        }
        self.simulcast_ssrc = 0;
        self.srtp_cleanup();
        self.reset();
    }
}

/// The four optional per-session recorders.
#[derive(Debug, Default)]
pub struct RecorderSet {
    pub user_audio: Option<Recorder>,
    pub user_video: Option<Recorder>,
    pub peer_audio: Option<Recorder>,
    pub peer_video: Option<Recorder>,
}

impl RecorderSet {
    /// Close the selected recorders; closing what is not open is a no-op.
    pub fn close(&mut self, audio: bool, peer_audio: bool, video: bool, peer_video: bool) {
        for (stop, slot) in [
            (audio, &mut self.user_audio),
            (peer_audio, &mut self.peer_audio),
            (video, &mut self.user_video),
            (peer_video, &mut self.peer_video),
        ] {
            if stop {
                if let Some(recorder) = slot.take() {
                    info!("Closed recording {}", recorder.filename());
                    recorder.close();
                }
            }
        }
    }
}

/// The last session description stored on the session, with a running
/// version for regenerations.
#[derive(Debug, Default)]
pub struct SdpState {
    pub description: Option<SessionDescription>,
    pub version: u64,
}

/// One bridged session, shared by the registry, the request worker and the
/// relay task.
pub struct Session {
    pub handle: SessionHandle,
    /// Short identifier used in log lines.
    pub id: Uuid,
    pub media: Mutex<MediaSession>,
    pub recorders: Mutex<RecorderSet>,
    pub sdp: Mutex<SdpState>,
    destroyed: AtomicBool,
    hangingup: AtomicBool,
    relay_running: AtomicBool,
    /// Wakes the relay out of its multiplex wait: session updates and
    /// teardown are both signalled here.
    pub wake: Notify,
}

impl Session {
    pub fn new(handle: SessionHandle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            id: Uuid::new_v4(),
            media: Mutex::new(MediaSession::new()),
            recorders: Mutex::new(RecorderSet::default()),
            sdp: Mutex::new(SdpState::default()),
            destroyed: AtomicBool::new(false),
            hangingup: AtomicBool::new(false),
            relay_running: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Mark the session destroyed. Returns false if it already was.
    pub fn mark_destroyed(&self) -> bool {
        let first = !self.destroyed.swap(true, Ordering::AcqRel);
        if first {
            self.wake.notify_one();
        }
        first
    }

    pub fn is_hanging_up(&self) -> bool {
        self.hangingup.load(Ordering::Acquire)
    }

    pub fn set_hanging_up(&self, value: bool) -> bool {
        let previous = self.hangingup.swap(value, Ordering::AcqRel);
        if value {
            self.wake.notify_one();
        }
        previous
    }

    pub fn relay_running(&self) -> bool {
        self.relay_running.load(Ordering::Acquire)
    }

    pub fn set_relay_running(&self, value: bool) {
        self.relay_running.store(value, Ordering::Release);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Map of live sessions keyed by the host's opaque handle.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionHandle, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        if self.sessions.contains_key(&handle) {
            return None;
        }
        let session = Session::new(handle);
        debug!("Created session {} for handle {}", session.id, handle);
        self.sessions.insert(handle, Arc::clone(&session));
        Some(session)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.sessions.get(&handle).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.sessions.remove(&handle).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn drain(&self) -> Vec<Arc<Session>> {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| *e.key()).collect();
        handles.into_iter().filter_map(|h| self.remove(h)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_session_defaults() {
        let media = MediaSession::new();
        assert!(!media.ready);
        assert_eq!(media.audio.pt, -1);
        assert!(media.audio.send_enabled);
        assert_eq!(media.opusred_pt, -1);
        assert_eq!(media.audio_level_extension_id, -1);
    }

    #[test]
    fn test_reset_keeps_ports() {
        let mut media = MediaSession::new();
        media.audio.local_rtp_port = 10000;
        media.audio.local_rtcp_port = 10001;
        media.audio.active = true;
        media.remote_audio_ip = Some("198.51.100.7".into());
        media.ready = true;

        media.reset();
        assert!(!media.ready);
        assert!(!media.audio.active);
        assert!(media.remote_audio_ip.is_none());
        assert_eq!(media.audio.local_rtp_port, 10000);
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let mut media = MediaSession::new();
        media.audio.local_rtp_port = 10000;
        media.audio.remote_rtp_port = 20000;
        media.audio.ssrc = 42;
        media.audio.ssrc_peer = 43;
        media.simulcast_ssrc = 7;
        media.has_srtp_local = true;

        media.cleanup();
        assert_eq!(media.audio.local_rtp_port, 0);
        assert_eq!(media.audio.remote_rtp_port, 0);
        assert_eq!(media.audio.ssrc, 0);
        assert_eq!(media.audio.ssrc_peer, 0);
        assert_eq!(media.simulcast_ssrc, 0);
        assert!(!media.has_srtp_local);
    }

    #[test]
    fn test_registry_create_get_remove() {
        let registry = SessionRegistry::new();
        let session = registry.create(7).unwrap();
        assert!(registry.create(7).is_none());
        assert_eq!(registry.get(7).unwrap().handle, session.handle);
        assert!(registry.remove(7).is_some());
        assert!(registry.get(7).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_destroy_is_sticky() {
        let session = Session::new(1);
        assert!(!session.is_destroyed());
        assert!(session.mark_destroyed());
        assert!(!session.mark_destroyed());
        assert!(session.is_destroyed());
    }
}
