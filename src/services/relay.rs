//! Bidirectional RTP/RTCP relay
//!
//! One relay task per session multiplexes the (up to) four peer-facing UDP
//! sockets together with the session's wake signal. Frames from the peer are
//! unprotected, normalized and handed to the host; frames from the WebRTC
//! side come in through [`forward_rtp`]/[`forward_rtcp`] on the caller's
//! task and go out on the same sockets.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::host::{HostCallbacks, PluginRtcpPacket, PluginRtpPacket, RtpExtensions};
use crate::protocols::{rtcp, rtp};
use crate::services::session::Session;

const RELAY_BUFFER_SIZE: usize = 1500;
const MAX_POLL_ERRORS: u32 = 100;
/// Kernel-reflected ICMP Port Unreachable on a connected UDP socket.
const ECONNREFUSED: i32 = 111;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    AudioRtp,
    AudioRtcp,
    VideoRtp,
    VideoRtcp,
}

impl Source {
    fn video(self) -> bool {
        matches!(self, Source::VideoRtp | Source::VideoRtcp)
    }

    fn rtcp(self) -> bool {
        matches!(self, Source::AudioRtcp | Source::VideoRtcp)
    }
}

/// Endpoints snapshot taken while `updated` was set; sockets are connected
/// outside the media lock.
struct ConnectPlan {
    audio_ip: Option<String>,
    video_ip: Option<String>,
    audio_rtp: Option<(Arc<UdpSocket>, u16)>,
    audio_rtcp: Option<(Arc<UdpSocket>, u16)>,
    video_rtp: Option<(Arc<UdpSocket>, u16)>,
    video_rtcp: Option<(Arc<UdpSocket>, u16)>,
}

async fn resolve_remote(session: &Session, host: &str) -> Option<IpAddr> {
    match lookup_host((host, 0u16)).await {
        Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
        Err(e) => {
            error!("[{}] Couldn't resolve address '{host}': {e}", session.id);
            None
        }
    }
}

async fn connect_socket(session: &Session, socket: &UdpSocket, ip: IpAddr, port: u16, what: &str) {
    if port == 0 {
        return;
    }
    if let Err(e) = socket.connect((ip, port)).await {
        error!("[{}] Couldn't connect {what}? ({ip}:{port}): {e}", session.id);
    }
}

async fn connect_sockets(session: &Session, plan: ConnectPlan) {
    // "0.0.0.0" in a description means "not set"; leave those alone.
    let audio_ip = match plan.audio_ip.as_deref().filter(|ip| *ip != "0.0.0.0") {
        Some(host) => resolve_remote(session, host).await,
        None => None,
    };
    let video_ip = match plan.video_ip.as_deref().filter(|ip| *ip != "0.0.0.0") {
        Some(host) => resolve_remote(session, host).await,
        None => None,
    };
    if audio_ip.is_none() && video_ip.is_none() {
        error!(
            "[{}] Couldn't update session details: no usable remote address",
            session.id
        );
        return;
    }
    if let (Some(ip), Some((socket, port))) = (audio_ip, plan.audio_rtp) {
        connect_socket(session, &socket, ip, port, "audio RTP").await;
    }
    if let (Some(ip), Some((socket, port))) = (audio_ip, plan.audio_rtcp) {
        connect_socket(session, &socket, ip, port, "audio RTCP").await;
    }
    if let (Some(ip), Some((socket, port))) = (video_ip, plan.video_rtp) {
        connect_socket(session, &socket, ip, port, "video RTP").await;
    }
    if let (Some(ip), Some((socket, port))) = (video_ip, plan.video_rtcp) {
        connect_socket(session, &socket, ip, port, "video RTCP").await;
    }
}

async fn recv_or_pending(socket: Option<Arc<UdpSocket>>, buf: &mut [u8]) -> io::Result<usize> {
    match socket {
        Some(socket) => socket.recv_from(buf).await.map(|(len, _)| len),
        None => std::future::pending().await,
    }
}

/// Relay frames coming from the plain peer until the session hangs up, is
/// destroyed, or the sockets die under us.
pub async fn relay_task(session: Arc<Session>, host: Arc<dyn HostCallbacks>) {
    info!("[{}] Starting relay task", session.id);
    session.set_relay_running(true);
    let mut poll_errors: u32 = 0;

    // Connect the UDP sockets upon loop entry.
    session.media.lock().await.updated = true;

    let mut audio_rtp_buf = [0u8; RELAY_BUFFER_SIZE];
    let mut audio_rtcp_buf = [0u8; RELAY_BUFFER_SIZE];
    let mut video_rtp_buf = [0u8; RELAY_BUFFER_SIZE];
    let mut video_rtcp_buf = [0u8; RELAY_BUFFER_SIZE];

    while !session.is_destroyed() && !session.is_hanging_up() {
        let (audio_rtp, audio_rtcp, video_rtp, video_rtcp, plan) = {
            let mut media = session.media.lock().await;
            let plan = if media.updated {
                media.updated = false;
                Some(ConnectPlan {
                    audio_ip: media.remote_audio_ip.clone(),
                    video_ip: media.remote_video_ip.clone(),
                    audio_rtp: media
                        .audio
                        .rtp_socket
                        .clone()
                        .map(|s| (s, media.audio.remote_rtp_port)),
                    audio_rtcp: media
                        .audio
                        .rtcp_socket
                        .clone()
                        .map(|s| (s, media.audio.remote_rtcp_port)),
                    video_rtp: media
                        .video
                        .rtp_socket
                        .clone()
                        .map(|s| (s, media.video.remote_rtp_port)),
                    video_rtcp: media
                        .video
                        .rtcp_socket
                        .clone()
                        .map(|s| (s, media.video.remote_rtcp_port)),
                })
            } else {
                None
            };
            (
                media.audio.rtp_socket.clone(),
                media.audio.rtcp_socket.clone(),
                media.video.rtp_socket.clone(),
                media.video.rtcp_socket.clone(),
                plan,
            )
        };
        if let Some(plan) = plan {
            debug!("[{}] Updating session sockets", session.id);
            connect_sockets(&session, plan).await;
        }

        let (source, result) = tokio::select! {
            biased;
            _ = session.wake.notified() => continue,
            r = recv_or_pending(audio_rtp, &mut audio_rtp_buf) => (Source::AudioRtp, r),
            r = recv_or_pending(audio_rtcp, &mut audio_rtcp_buf) => (Source::AudioRtcp, r),
            r = recv_or_pending(video_rtp, &mut video_rtp_buf) => (Source::VideoRtp, r),
            r = recv_or_pending(video_rtcp, &mut video_rtcp_buf) => (Source::VideoRtcp, r),
            _ = sleep(POLL_TIMEOUT) => continue,
        };

        let len = match result {
            Ok(len) => len,
            Err(e) => {
                let mut media = session.media.lock().await;
                if media.updated {
                    // A session update is pending; the error is likely stale.
                    continue;
                }
                if e.raw_os_error() == Some(ECONNREFUSED) && source.rtcp() {
                    // RTCP is expendable; RTP keeps flowing without it.
                    warn!(
                        "[{}] Got a '{e}' on the {} RTCP socket, closing it",
                        session.id,
                        if source.video() { "video" } else { "audio" }
                    );
                    media.stream_mut(source.video()).rtcp_socket = None;
                    continue;
                }
                drop(media);
                poll_errors += 1;
                if poll_errors < MAX_POLL_ERRORS {
                    continue;
                }
                error!(
                    "[{}] Too many errors on the {} {} socket: {e}",
                    session.id,
                    if source.video() { "video" } else { "audio" },
                    if source.rtcp() { "RTCP" } else { "RTP" }
                );
                host.close_pc(session.handle);
                break;
            }
        };

        let video = source.video();
        if !source.rtcp() {
            let data = match source {
                Source::AudioRtp => &audio_rtp_buf[..len],
                _ => &video_rtp_buf[..len],
            };
            if !rtp::looks_like_rtp(data) {
                continue;
            }
            poll_errors = 0;
            let mut media = session.media.lock().await;
            let stream = media.stream_mut(video);
            let pkt_ssrc = rtp::ssrc(data);
            if stream.ssrc_peer == 0 {
                stream.ssrc_peer = pkt_ssrc;
                debug!(
                    "[{}] Got peer {} SSRC: {}",
                    session.id,
                    if video { "video" } else { "audio" },
                    stream.ssrc_peer
                );
            }
            let mut packet: Vec<u8> = if media.has_srtp_remote {
                let stream = media.stream_mut(video);
                match stream.srtp_in.as_mut().and_then(|c| c.unprotect_rtp(data, video)) {
                    Some(plain) => plain.to_vec(),
                    None => continue,
                }
            } else {
                data.to_vec()
            };
            // Normalize the stream across SSRC changes (e.g., after a
            // renegotiation on the peer side), then present the stable SSRC.
            let stream = media.stream_mut(video);
            stream.switching.update(&mut packet, video);
            rtp::set_ssrc(&mut packet, stream.ssrc_peer);

            let audio_level_id = media.audio_level_extension_id;
            let orientation_id = media.video_orientation_extension_id;
            drop(media);

            {
                let recorders = session.recorders.lock().await;
                let tap = if video { &recorders.peer_video } else { &recorders.peer_audio };
                if let Some(recorder) = tap {
                    recorder.save_frame(&packet);
                }
            }

            let mut extensions = RtpExtensions::default();
            if !video && audio_level_id != -1 {
                if let Some((vad, level)) = rtp::parse_audio_level(&packet, audio_level_id) {
                    extensions.audio_level = Some(level);
                    extensions.audio_level_vad = vad;
                }
            } else if video && orientation_id > 0 {
                if let Some((c, f, r1, r0)) = rtp::parse_video_orientation(&packet, orientation_id)
                {
                    extensions.video_rotation = Some(rtp::rotation_degrees(r1, r0));
                    extensions.video_back_camera = c;
                    extensions.video_flipped = f;
                }
            }

            host.relay_rtp(
                session.handle,
                PluginRtpPacket {
                    mindex: -1,
                    video,
                    buffer: packet,
                    extensions,
                },
            );
        } else {
            let data = match source {
                Source::AudioRtcp => &audio_rtcp_buf[..len],
                _ => &video_rtcp_buf[..len],
            };
            if !rtcp::looks_like_rtcp(data) {
                continue;
            }
            let mut media = session.media.lock().await;
            let packet: Vec<u8> = if media.has_srtp_remote {
                let stream = media.stream_mut(video);
                match stream.srtp_in.as_mut().and_then(|c| c.unprotect_rtcp(data, video)) {
                    Some(plain) => plain.to_vec(),
                    None => continue,
                }
            } else {
                data.to_vec()
            };
            drop(media);
            host.relay_rtcp(session.handle, PluginRtcpPacket { video, buffer: packet });
        }
    }

    // Teardown: release the media plane whatever made us leave the loop.
    {
        let mut media = session.media.lock().await;
        media.cleanup();
    }
    session.set_relay_running(false);
    session.set_hanging_up(false);
    info!("[{}] Leaving relay task", session.id);
}

/// Push a WebRTC-side RTP frame out to the plain peer.
pub async fn forward_rtp(session: &Session, packet: &PluginRtpPacket) {
    if packet.buffer.len() < rtp::RTP_HEADER_LEN {
        return;
    }
    let video = packet.video;
    let mut media = session.media.lock().await;
    if !media.stream(video).send_enabled {
        // The peer declared itself sendonly/inactive.
        return;
    }
    if video && media.simulcast_ssrc != 0 && rtp::ssrc(&packet.buffer) != media.simulcast_ssrc {
        trace!("Dropping packet (not the base simulcast substream)");
        return;
    }
    let stream = media.stream_mut(video);
    if stream.ssrc == 0 {
        stream.ssrc = rtp::ssrc(&packet.buffer);
        debug!(
            "Got local {} SSRC: {}",
            if video { "video" } else { "audio" },
            stream.ssrc
        );
    }
    if !stream.active {
        return;
    }
    let Some(socket) = stream.rtp_socket.clone() else {
        return;
    };

    {
        let recorders = session.recorders.lock().await;
        let tap = if video { &recorders.user_video } else { &recorders.user_audio };
        if let Some(recorder) = tap {
            recorder.save_frame(&packet.buffer);
        }
    }

    let out: Vec<u8> = if media.has_srtp_local {
        let stream = media.stream_mut(video);
        match stream.srtp_out.as_mut() {
            Some(context) => match context.protect_rtp(&packet.buffer) {
                Ok(protected) => protected.to_vec(),
                Err(e) => {
                    warn!(
                        "{} SRTP protect error: {e} (len={}, ts={}, seq={})",
                        if video { "Video" } else { "Audio" },
                        packet.buffer.len(),
                        rtp::timestamp(&packet.buffer),
                        rtp::sequence_number(&packet.buffer),
                    );
                    return;
                }
            },
            None => return,
        }
    } else {
        packet.buffer.clone()
    };
    drop(media);

    if let Err(e) = socket.send(&out).await {
        debug!(
            "Error sending {} RTP packet: {e} (len={})",
            if video { "Video" } else { "Audio" },
            out.len()
        );
    }
}

/// Push a WebRTC-side RTCP packet out to the plain peer, after making its
/// SSRC identifiers consistent with what the peer has learned.
pub async fn forward_rtcp(session: &Session, packet: &PluginRtcpPacket) {
    let video = packet.video;
    let mut media = session.media.lock().await;
    let stream = media.stream(video);
    if !stream.active {
        return;
    }
    let Some(socket) = stream.rtcp_socket.clone() else {
        return;
    };
    let mut buffer = packet.buffer.clone();
    trace!(
        "Fixing {} SSRCs (local {}, peer {})",
        if video { "video" } else { "audio" },
        stream.ssrc,
        stream.ssrc_peer
    );
    rtcp::fix_ssrc(&mut buffer, stream.ssrc, stream.ssrc_peer);

    let out: Vec<u8> = if media.has_srtp_local {
        let stream = media.stream_mut(video);
        match stream.srtp_out.as_mut() {
            Some(context) => match context.protect_rtcp(&buffer) {
                Ok(protected) => protected.to_vec(),
                Err(e) => {
                    warn!(
                        "{} SRTCP protect error: {e} (len={})",
                        if video { "Video" } else { "Audio" },
                        buffer.len()
                    );
                    return;
                }
            },
            None => return,
        }
    } else {
        buffer
    };
    drop(media);

    if let Err(e) = socket.send(&out).await {
        debug!(
            "Error sending {} RTCP packet: {e} (len={})",
            if video { "Video" } else { "Audio" },
            out.len()
        );
    }
}

/// Build and send an RTCP PLI to the peer's video RTCP socket. No-op when
/// video is not negotiated or the socket is gone.
pub async fn send_peer_pli(session: &Session) {
    let mut media = session.media.lock().await;
    if !media.video.active {
        return;
    }
    let Some(socket) = media.video.rtcp_socket.clone() else {
        return;
    };
    let pli = rtcp::build_pli(media.video.ssrc, media.video.ssrc_peer);
    let out: Vec<u8> = if media.has_srtp_local {
        match media.video.srtp_out.as_mut() {
            Some(context) => match context.protect_rtcp(&pli) {
                Ok(protected) => protected.to_vec(),
                Err(e) => {
                    warn!("Video SRTCP protect error on PLI: {e}");
                    return;
                }
            },
            None => return,
        }
    } else {
        pli.to_vec()
    };
    drop(media);

    if let Err(e) = socket.send(&out).await {
        debug!("Error sending RTCP PLI to the peer: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::host::SessionHandle;
    use crate::protocols::rtp::RtpPacket;
    use crate::services::ports::PortAllocator;
    use crate::services::session::Session;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct MockHost {
        rtp_tx: mpsc::UnboundedSender<PluginRtpPacket>,
        rtcp_tx: mpsc::UnboundedSender<PluginRtcpPacket>,
        closed: StdMutex<Vec<SessionHandle>>,
    }

    impl MockHost {
        fn new() -> (
            Arc<Self>,
            mpsc::UnboundedReceiver<PluginRtpPacket>,
            mpsc::UnboundedReceiver<PluginRtcpPacket>,
        ) {
            let (rtp_tx, rtp_rx) = mpsc::unbounded_channel();
            let (rtcp_tx, rtcp_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    rtp_tx,
                    rtcp_tx,
                    closed: StdMutex::new(Vec::new()),
                }),
                rtp_rx,
                rtcp_rx,
            )
        }
    }

    impl HostCallbacks for MockHost {
        fn relay_rtp(&self, _handle: SessionHandle, packet: PluginRtpPacket) {
            let _ = self.rtp_tx.send(packet);
        }
        fn relay_rtcp(&self, _handle: SessionHandle, packet: PluginRtcpPacket) {
            let _ = self.rtcp_tx.send(packet);
        }
        fn send_pli(&self, _handle: SessionHandle) {}
        fn close_pc(&self, handle: SessionHandle) {
            self.closed.lock().unwrap().push(handle);
        }
        fn notify_event(&self, _handle: SessionHandle, _event: serde_json::Value) {}
        fn events_is_enabled(&self) -> bool {
            false
        }
        fn push_event(
            &self,
            _handle: SessionHandle,
            _transaction: &str,
            _event: serde_json::Value,
            _jsep: Option<crate::host::Jsep>,
        ) {
        }
    }

    /// Set up a session with an audio leg pointed at a local "peer" socket.
    async fn audio_session(range: PortRange) -> (Arc<Session>, Arc<UdpSocket>) {
        let ports = PortAllocator::new(range, None, false, 0, 0);
        let pair = ports.allocate_pair(false).unwrap();
        let peer = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_port = peer.local_addr().unwrap().port();
        peer.connect(("127.0.0.1", pair.rtp_port)).await.unwrap();

        let session = Session::new(1);
        {
            let mut media = session.media.lock().await;
            media.audio.active = true;
            media.audio.rtp_socket = Some(Arc::clone(&pair.rtp_socket));
            media.audio.rtcp_socket = Some(Arc::clone(&pair.rtcp_socket));
            media.audio.local_rtp_port = pair.rtp_port;
            media.audio.local_rtcp_port = pair.rtcp_port;
            media.audio.remote_rtp_port = peer_port;
            media.audio.remote_rtcp_port = peer_port + 1;
            media.remote_audio_ip = Some("127.0.0.1".to_string());
        }
        (session, peer)
    }

    #[tokio::test]
    async fn test_relay_delivers_peer_rtp() {
        let (session, peer) = audio_session(PortRange { min: 42000, max: 42100 }).await;
        let (host, mut rtp_rx, _rtcp_rx) = MockHost::new();
        let relay = tokio::spawn(relay_task(
            Arc::clone(&session),
            Arc::clone(&host) as Arc<dyn HostCallbacks>,
        ));

        // Give the relay a moment to connect the sockets.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut packet = RtpPacket::new(111, 42, 9600, 0xABCD);
        packet.payload = bytes::Bytes::from_static(b"hello peer");
        peer.send(&packet.encode()).await.unwrap();

        let received = timeout(Duration::from_secs(2), rtp_rx.recv())
            .await
            .expect("relay timed out")
            .expect("relay channel closed");
        assert!(!received.video);
        assert_eq!(rtp::ssrc(&received.buffer), 0xABCD);
        assert_eq!(&received.buffer[rtp::RTP_HEADER_LEN..], b"hello peer");

        // The peer SSRC was learned from the first packet; a new SSRC is
        // rewritten back to it.
        let mut packet = RtpPacket::new(111, 43, 10560, 0x9999);
        packet.payload = bytes::Bytes::from_static(b"second");
        peer.send(&packet.encode()).await.unwrap();
        let received = timeout(Duration::from_secs(2), rtp_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rtp::ssrc(&received.buffer), 0xABCD);

        session.mark_destroyed();
        timeout(Duration::from_secs(2), relay).await.unwrap().unwrap();
        // Teardown released the sockets and ports.
        let media = session.media.lock().await;
        assert!(media.audio.rtp_socket.is_none());
        assert_eq!(media.audio.local_rtp_port, 0);
    }

    #[tokio::test]
    async fn test_relay_ignores_non_rtp_noise() {
        let (session, peer) = audio_session(PortRange { min: 42100, max: 42200 }).await;
        let (host, mut rtp_rx, _rtcp_rx) = MockHost::new();
        let relay = tokio::spawn(relay_task(
            Arc::clone(&session),
            Arc::clone(&host) as Arc<dyn HostCallbacks>,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        peer.send(b"definitely not rtp").await.unwrap();
        let mut packet = RtpPacket::new(111, 1, 960, 0x1111);
        packet.payload = bytes::Bytes::from_static(b"real");
        peer.send(&packet.encode()).await.unwrap();

        let received = timeout(Duration::from_secs(2), rtp_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received.buffer[rtp::RTP_HEADER_LEN..], b"real");

        session.mark_destroyed();
        timeout(Duration::from_secs(2), relay).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_rtp_reaches_peer() {
        let (session, peer) = audio_session(PortRange { min: 42200, max: 42300 }).await;
        {
            // Connect the local socket the way the relay's update pass would.
            let media = session.media.lock().await;
            let socket = media.audio.rtp_socket.clone().unwrap();
            let port = media.audio.remote_rtp_port;
            socket.connect(("127.0.0.1", port)).await.unwrap();
        }

        let mut packet = RtpPacket::new(111, 7, 1920, 0x4242);
        packet.payload = bytes::Bytes::from_static(b"outbound");
        forward_rtp(&session, &PluginRtpPacket::new(false, packet.encode())).await;

        let mut buf = [0u8; 1500];
        let len = timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[rtp::RTP_HEADER_LEN..len], b"outbound");
        // The local SSRC was learned from the first outbound frame.
        assert_eq!(session.media.lock().await.audio.ssrc, 0x4242);
    }

    #[tokio::test]
    async fn test_forward_rtp_honours_direction_flag() {
        let (session, peer) = audio_session(PortRange { min: 42300, max: 42400 }).await;
        {
            let mut media = session.media.lock().await;
            let socket = media.audio.rtp_socket.clone().unwrap();
            let port = media.audio.remote_rtp_port;
            socket.connect(("127.0.0.1", port)).await.unwrap();
            media.audio.send_enabled = false;
        }

        let packet = RtpPacket::new(111, 8, 2880, 0x4242).encode();
        forward_rtp(&session, &PluginRtpPacket::new(false, packet)).await;

        let mut buf = [0u8; 1500];
        assert!(timeout(Duration::from_millis(200), peer.recv(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_forward_rtp_simulcast_base_layer_only() {
        let (session, peer) = audio_session(PortRange { min: 42400, max: 42500 }).await;
        {
            let mut media = session.media.lock().await;
            // Reuse the audio leg as a video leg for the filter check.
            media.video.active = true;
            media.video.rtp_socket = media.audio.rtp_socket.clone();
            media.simulcast_ssrc = 0xBA5E;
            let socket = media.video.rtp_socket.clone().unwrap();
            let port = media.audio.remote_rtp_port;
            socket.connect(("127.0.0.1", port)).await.unwrap();
        }

        let high = RtpPacket::new(96, 1, 3000, 0x7777).encode();
        forward_rtp(&session, &PluginRtpPacket::new(true, high)).await;
        let base = RtpPacket::new(96, 2, 3000, 0xBA5E).encode();
        forward_rtp(&session, &PluginRtpPacket::new(true, base)).await;

        let mut buf = [0u8; 1500];
        let len = timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        // Only the base-layer packet went out.
        assert_eq!(rtp::ssrc(&buf[..len]), 0xBA5E);
        assert!(timeout(Duration::from_millis(200), peer.recv(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_forward_rtcp_fixes_ssrcs() {
        let (session, peer) = audio_session(PortRange { min: 42500, max: 42600 }).await;
        {
            let mut media = session.media.lock().await;
            let socket = media.audio.rtcp_socket.clone().unwrap();
            media.audio.ssrc = 0x0A0A;
            media.audio.ssrc_peer = 0x0B0B;
            let peer_addr = peer.local_addr().unwrap();
            socket.connect(peer_addr).await.unwrap();
        }
        // The peer should listen where the RTCP socket sends from.
        let rtcp_socket = session.media.lock().await.audio.rtcp_socket.clone().unwrap();
        let rtcp_port = rtcp_socket.local_addr().unwrap().port();
        peer.connect(("127.0.0.1", rtcp_port)).await.unwrap();

        let mut report = vec![0x80, rtcp::RTCP_PT_RR, 0, 7];
        report.extend_from_slice(&0xDEADu32.to_be_bytes());
        report.extend_from_slice(&0xBEEFu32.to_be_bytes());
        report.extend_from_slice(&[0u8; 20]);
        forward_rtcp(
            &session,
            &PluginRtcpPacket { video: false, buffer: report },
        )
        .await;

        let mut buf = [0u8; 1500];
        let len = timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[4..8], &0x0A0Au32.to_be_bytes());
        assert_eq!(&buf[8..12], &0x0B0Bu32.to_be_bytes());
        assert_eq!(len, 32);
    }

    #[tokio::test]
    async fn test_send_peer_pli() {
        let (session, peer) = audio_session(PortRange { min: 42600, max: 42700 }).await;
        {
            let mut media = session.media.lock().await;
            media.video.active = true;
            media.video.rtcp_socket = media.audio.rtcp_socket.clone();
            media.video.ssrc = 0x1234;
            media.video.ssrc_peer = 0x5678;
            let socket = media.video.rtcp_socket.clone().unwrap();
            socket.connect(peer.local_addr().unwrap()).await.unwrap();
            let rtcp_port = socket.local_addr().unwrap().port();
            peer.connect(("127.0.0.1", rtcp_port)).await.unwrap();
        }

        send_peer_pli(&session).await;

        let mut buf = [0u8; 64];
        let len = timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 12);
        assert_eq!(buf[1], rtcp::RTCP_PT_PSFB);
        assert_eq!(&buf[4..8], &0x1234u32.to_be_bytes());
        assert_eq!(&buf[8..12], &0x5678u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_send_peer_pli_without_video_is_noop() {
        let (session, _peer) = audio_session(PortRange { min: 42700, max: 42800 }).await;
        // No video negotiated: must simply return.
        send_peer_pli(&session).await;
    }

    #[tokio::test]
    async fn test_relay_exits_on_hangup() {
        let (session, _peer) = audio_session(PortRange { min: 42800, max: 42900 }).await;
        let (host, _rtp_rx, _rtcp_rx) = MockHost::new();
        let relay = tokio::spawn(relay_task(
            Arc::clone(&session),
            Arc::clone(&host) as Arc<dyn HostCallbacks>,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.set_hanging_up(true);
        timeout(Duration::from_secs(2), relay).await.unwrap().unwrap();
        assert!(!session.is_hanging_up());
        assert!(!session.relay_running());
    }
}
