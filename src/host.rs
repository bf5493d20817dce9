//! Interface between the plugin core and the embedding host.
//!
//! The plugin never talks to a network signalling stack or a WebRTC engine
//! directly. Decrypted WebRTC frames come *in* through the plugin entry
//! points, and everything going *out* towards the application crosses the
//! [`HostCallbacks`] trait: peer media being relayed upward, keyframe
//! requests, PeerConnection teardown, and the asynchronous responses to
//! queued requests.

use serde::{Deserialize, Serialize};

/// Opaque per-session identifier chosen by the host.
pub type SessionHandle = u64;

/// RTP header-extension values extracted from a relayed peer packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpExtensions {
    /// Audio level in -dBov (0..=127), when the peer negotiated the
    /// ssrc-audio-level extension.
    pub audio_level: Option<u8>,
    pub audio_level_vad: bool,
    /// Video rotation in degrees (0, 90, 180 or 270), when the peer
    /// negotiated the video-orientation extension.
    pub video_rotation: Option<u16>,
    pub video_back_camera: bool,
    pub video_flipped: bool,
}

/// An RTP frame crossing the plugin boundary, in either direction.
#[derive(Debug, Clone)]
pub struct PluginRtpPacket {
    /// Media-line index; always -1 here, the bridge works per-medium.
    pub mindex: i32,
    pub video: bool,
    pub buffer: Vec<u8>,
    pub extensions: RtpExtensions,
}

impl PluginRtpPacket {
    pub fn new(video: bool, buffer: Vec<u8>) -> Self {
        Self {
            mindex: -1,
            video,
            buffer,
            extensions: RtpExtensions::default(),
        }
    }
}

/// An RTCP compound packet crossing the plugin boundary.
#[derive(Debug, Clone)]
pub struct PluginRtcpPacket {
    pub video: bool,
    pub buffer: Vec<u8>,
}

/// A WebRTC-side session description attached to a request or pushed back
/// with a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub update: bool,
    /// End-to-end encrypted media cannot be bridged to a plain peer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub e2ee: bool,
    /// Simulcast description, if the WebRTC side negotiated any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulcast: Option<serde_json::Value>,
}

impl Jsep {
    pub fn new(kind: &str, sdp: String) -> Self {
        Self {
            kind: kind.to_string(),
            sdp,
            update: false,
            e2ee: false,
            simulcast: None,
        }
    }
}

/// Upcalls the plugin makes into the embedding host.
///
/// Implementations must be cheap and non-blocking: `relay_rtp` in particular
/// is invoked once per relayed datagram.
pub trait HostCallbacks: Send + Sync + 'static {
    /// Deliver a peer-originated RTP frame to the WebRTC side.
    fn relay_rtp(&self, handle: SessionHandle, packet: PluginRtpPacket);

    /// Deliver a peer-originated RTCP packet to the WebRTC side.
    fn relay_rtcp(&self, handle: SessionHandle, packet: PluginRtcpPacket);

    /// Ask the WebRTC side for a keyframe.
    fn send_pli(&self, handle: SessionHandle);

    /// Tear down the WebRTC PeerConnection of a session.
    fn close_pc(&self, handle: SessionHandle);

    /// Forward a lifecycle event to external event handlers.
    fn notify_event(&self, handle: SessionHandle, event: serde_json::Value);

    /// Whether event handlers are attached at all; used to skip building
    /// notification payloads nobody will see.
    fn events_is_enabled(&self) -> bool;

    /// Deliver the asynchronous response to a queued request.
    fn push_event(
        &self,
        handle: SessionHandle,
        transaction: &str,
        event: serde_json::Value,
        jsep: Option<Jsep>,
    );
}
