//! Plugin facade: lifecycle and host-facing entry points
//!
//! One [`RtpBridge`] instance per embedding host. Construction resolves the
//! network configuration (address family, bind/advertised addresses), builds
//! the port allocator and starts the request worker; afterwards the host
//! drives everything through the downcalls below and receives results via
//! its [`HostCallbacks`] implementation.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::{json, Value};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{detect_local_ip, BridgeConfig};
use crate::host::{HostCallbacks, Jsep, PluginRtcpPacket, PluginRtpPacket, SessionHandle};
use crate::services::ports::PortAllocator;
use crate::services::relay;
use crate::services::requests::{self, PendingRequest, RequestContext, WorkerMessage};
use crate::services::session::{Session, SessionRegistry};
use crate::{Error, Result};

pub struct RtpBridge {
    ctx: Arc<RequestContext>,
    registry: Arc<SessionRegistry>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    stopping: AtomicBool,
    advertised_ip: String,
    local_ip: Option<IpAddr>,
    ipv6_disabled: bool,
}

/// Probe whether IPv6 sockets with the v6-only flag cleared are available.
fn probe_ipv6() -> bool {
    match Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(socket) => socket.set_only_v6(false).is_ok(),
        Err(_) => false,
    }
}

impl RtpBridge {
    /// Build the plugin and start its request worker. Must be called from
    /// within a tokio runtime.
    pub fn new(config: BridgeConfig, host: Arc<dyn HostCallbacks>) -> Result<Arc<Self>> {
        config.validate()?;
        let local_ip = config.resolved_local_ip();
        let general = config.general;

        // One address family per plugin instance.
        let mut ipv6_disabled = false;
        match local_ip {
            Some(IpAddr::V4(_)) => ipv6_disabled = true,
            _ => {
                if !probe_ipv6() {
                    ipv6_disabled = true;
                    if matches!(local_ip, Some(IpAddr::V6(_))) {
                        return Err(Error::config(
                            "IPv6 disabled and local media address is IPv6",
                        ));
                    }
                    warn!("IPv6 disabled, will only use IPv4 for RTP/RTCP sockets");
                }
            }
        }
        let use_ipv6 = !ipv6_disabled;

        let advertised_ip = general
            .sdp_ip
            .clone()
            .or_else(|| local_ip.map(|ip| ip.to_string()))
            .or_else(|| detect_local_ip().map(|ip| ip.to_string()))
            .unwrap_or_else(|| {
                warn!("Couldn't find any address! Using 127.0.0.1 as the advertised IP");
                "127.0.0.1".to_string()
            });
        debug!("Binding media address set to [{:?}], advertising [{advertised_ip}]", local_ip);

        let registry = Arc::new(SessionRegistry::new());
        let ports = Arc::new(PortAllocator::new(
            general.rtp_port_range,
            local_ip,
            use_ipv6,
            general.dscp_audio_rtp,
            general.dscp_video_rtp,
        ));
        let ctx = Arc::new(RequestContext {
            host,
            registry: Arc::clone(&registry),
            ports,
            advertised_ip: advertised_ip.clone(),
            notify_events: general.events,
            recordings_dir: general.recordings_dir.map(PathBuf::from),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(requests::run_worker(Arc::clone(&ctx), rx));

        let bridge = Arc::new(Self {
            ctx,
            registry,
            tx,
            worker: StdMutex::new(Some(worker)),
            initialized: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            advertised_ip,
            local_ip,
            ipv6_disabled,
        });
        info!("{} v{} initialized", crate::NAME, crate::VERSION);
        Ok(bridge)
    }

    fn gate(&self) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::wrong_state("Shutting down"));
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::wrong_state("Plugin not initialized"));
        }
        Ok(())
    }

    pub fn advertised_ip(&self) -> &str {
        &self.advertised_ip
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    pub fn ipv6_disabled(&self) -> bool {
        self.ipv6_disabled
    }

    pub fn create_session(&self, handle: SessionHandle) -> Result<()> {
        self.gate()?;
        self.registry
            .create(handle)
            .map(|_| ())
            .ok_or_else(|| Error::wrong_state(format!("Session {handle} already exists")))
    }

    pub async fn destroy_session(&self, handle: SessionHandle) -> Result<()> {
        self.gate()?;
        let session = self
            .registry
            .get(handle)
            .ok_or_else(|| Error::internal("No session associated with this handle"))?;
        debug!("Destroying session {}", session.id);
        self.hangup_media_internal(&session).await;
        session.mark_destroyed();
        self.registry.remove(handle);
        Ok(())
    }

    /// Queue a request for the worker. Accepting the message only means it
    /// will be answered asynchronously through `push_event`.
    pub fn handle_message(
        &self,
        handle: SessionHandle,
        transaction: &str,
        message: Option<Value>,
        jsep: Option<Jsep>,
    ) -> Result<()> {
        self.gate()?;
        if self.registry.get(handle).is_none() {
            return Err(Error::internal("No session associated with this handle"));
        }
        self.tx
            .send(WorkerMessage::Request(PendingRequest {
                handle,
                transaction: transaction.to_string(),
                message,
                jsep,
            }))
            .map_err(|_| Error::wrong_state("Shutting down"))
    }

    /// The WebRTC PeerConnection is up.
    pub fn setup_media(&self, handle: SessionHandle) {
        if self.gate().is_err() {
            return;
        }
        let Some(session) = self.registry.get(handle) else {
            return;
        };
        if session.is_destroyed() {
            return;
        }
        info!("[{}] WebRTC media is now available", session.id);
        session.set_hanging_up(false);
    }

    /// The WebRTC PeerConnection is gone; stop bridging and release media.
    pub async fn hangup_media(&self, handle: SessionHandle) {
        if self.gate().is_err() {
            return;
        }
        let Some(session) = self.registry.get(handle) else {
            return;
        };
        self.hangup_media_internal(&session).await;
    }

    async fn hangup_media_internal(&self, session: &Arc<Session>) {
        if session.is_destroyed() {
            return;
        }
        if session.set_hanging_up(true) {
            // Already hanging up.
            return;
        }
        info!("[{}] No WebRTC media anymore", session.id);
        {
            let mut media = session.media.lock().await;
            media.simulcast_ssrc = 0;
            // The relay cleans up after itself; with no relay running it is
            // on us.
            if !media.ready && !session.relay_running() {
                media.cleanup();
                session.set_hanging_up(false);
            }
        }
        let mut recorders = session.recorders.lock().await;
        recorders.close(true, true, true, true);
    }

    /// Decrypted RTP from the WebRTC side, to be pushed to the peer.
    pub async fn incoming_rtp(&self, handle: SessionHandle, packet: PluginRtpPacket) {
        if self.gate().is_err() {
            return;
        }
        let Some(session) = self.registry.get(handle) else {
            return;
        };
        if session.is_destroyed() {
            return;
        }
        relay::forward_rtp(&session, &packet).await;
    }

    /// RTCP from the WebRTC side, to be pushed to the peer.
    pub async fn incoming_rtcp(&self, handle: SessionHandle, packet: PluginRtcpPacket) {
        if self.gate().is_err() {
            return;
        }
        let Some(session) = self.registry.get(handle) else {
            return;
        };
        if session.is_destroyed() {
            return;
        }
        relay::forward_rtcp(&session, &packet).await;
    }

    /// Introspection for the host's admin surface.
    pub async fn query_session(&self, handle: SessionHandle) -> Result<Value> {
        self.gate()?;
        let session = self
            .registry
            .get(handle)
            .ok_or_else(|| Error::internal("No session associated with this handle"))?;

        let mut details = json!({});
        if session.sdp.lock().await.description.is_some() {
            let media = session.media.lock().await;
            details["srtp-required"] = json!(if media.require_srtp { "yes" } else { "no" });
            details["sdes-local"] = json!(if media.has_srtp_local { "yes" } else { "no" });
            details["sdes-remote"] = json!(if media.has_srtp_remote { "yes" } else { "no" });
        }
        {
            let recorders = session.recorders.lock().await;
            let mut recording = json!({});
            if let Some(rc) = &recorders.user_audio {
                recording["audio"] = json!(rc.filename());
            }
            if let Some(rc) = &recorders.user_video {
                recording["video"] = json!(rc.filename());
            }
            if let Some(rc) = &recorders.peer_audio {
                recording["audio-peer"] = json!(rc.filename());
            }
            if let Some(rc) = &recorders.peer_video {
                recording["video-peer"] = json!(rc.filename());
            }
            if recording.as_object().is_some_and(|o| !o.is_empty()) {
                details["recording"] = recording;
            }
        }
        details["hangingup"] = json!(session.is_hanging_up() as u8);
        details["destroyed"] = json!(session.is_destroyed() as u8);
        Ok(details)
    }

    /// Tear the plugin down: destroy the sessions, stop the worker.
    pub async fn destroy(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for session in self.registry.drain() {
            session.mark_destroyed();
            let mut recorders = session.recorders.lock().await;
            recorders.close(true, true, true, true);
        }
        let _ = self.tx.send(WorkerMessage::Exit);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.initialized.store(false, Ordering::Release);
        info!("{} destroyed", crate::NAME);
    }

    /// Expose the request context for embedding hosts that want to drive
    /// request handling on their own executor.
    pub fn context(&self) -> Arc<RequestContext> {
        Arc::clone(&self.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeneralConfig, PortRange};
    use std::sync::Mutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    struct MockHost {
        pushed_tx: UnboundedSender<(SessionHandle, String, Value, Option<Jsep>)>,
        plis: Mutex<u32>,
    }

    impl MockHost {
        fn new() -> (
            Arc<Self>,
            UnboundedReceiver<(SessionHandle, String, Value, Option<Jsep>)>,
        ) {
            let (pushed_tx, pushed_rx) = unbounded_channel();
            (
                Arc::new(Self {
                    pushed_tx,
                    plis: Mutex::new(0),
                }),
                pushed_rx,
            )
        }
    }

    impl HostCallbacks for MockHost {
        fn relay_rtp(&self, _handle: SessionHandle, _packet: PluginRtpPacket) {}
        fn relay_rtcp(&self, _handle: SessionHandle, _packet: PluginRtcpPacket) {}
        fn send_pli(&self, _handle: SessionHandle) {
            *self.plis.lock().unwrap() += 1;
        }
        fn close_pc(&self, _handle: SessionHandle) {}
        fn notify_event(&self, _handle: SessionHandle, _event: Value) {}
        fn events_is_enabled(&self) -> bool {
            false
        }
        fn push_event(
            &self,
            handle: SessionHandle,
            transaction: &str,
            event: Value,
            jsep: Option<Jsep>,
        ) {
            let _ = self
                .pushed_tx
                .send((handle, transaction.to_string(), event, jsep));
        }
    }

    fn test_config(range: PortRange) -> BridgeConfig {
        BridgeConfig {
            general: GeneralConfig {
                sdp_ip: Some("192.0.2.5".to_string()),
                rtp_port_range: range,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    const OFFER: &str = "v=0\r\n\
        o=- 20518 0 IN IP4 0.0.0.0\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:111 opus/48000/2\r\n";

    #[tokio::test]
    async fn test_full_message_lifecycle() {
        let (host, mut pushed_rx) = MockHost::new();
        let bridge = RtpBridge::new(
            test_config(PortRange { min: 44400, max: 44500 }),
            Arc::clone(&host) as Arc<dyn HostCallbacks>,
        )
        .unwrap();

        bridge.create_session(9).unwrap();
        assert!(bridge.create_session(9).is_err());

        bridge
            .handle_message(
                9,
                "txn-1",
                Some(json!({"request": "generate", "srtp": "sdes_optional"})),
                Some(Jsep::new("offer", OFFER.to_string())),
            )
            .unwrap();

        let (handle, transaction, event, jsep) =
            tokio::time::timeout(std::time::Duration::from_secs(2), pushed_rx.recv())
                .await
                .expect("worker timed out")
                .unwrap();
        assert_eq!(handle, 9);
        assert_eq!(transaction, "txn-1");
        assert_eq!(event["nosip"], "event");
        assert_eq!(event["result"]["event"], "generated");
        assert!(jsep.is_none());

        let info = bridge.query_session(9).await.unwrap();
        assert_eq!(info["srtp-required"], "no");
        assert_eq!(info["sdes-local"], "yes");
        assert_eq!(info["destroyed"], 0);

        bridge.destroy_session(9).await.unwrap();
        assert!(bridge.query_session(9).await.is_err());
        bridge.destroy().await;
        assert!(bridge.create_session(10).is_err());
    }

    #[tokio::test]
    async fn test_handle_message_requires_session() {
        let (host, _pushed_rx) = MockHost::new();
        let bridge = RtpBridge::new(
            test_config(PortRange { min: 44500, max: 44600 }),
            Arc::clone(&host) as Arc<dyn HostCallbacks>,
        )
        .unwrap();
        assert!(bridge
            .handle_message(77, "t", Some(json!({"request": "hangup"})), None)
            .is_err());
        bridge.destroy().await;
    }

    #[tokio::test]
    async fn test_errors_are_pushed_asynchronously() {
        let (host, mut pushed_rx) = MockHost::new();
        let bridge = RtpBridge::new(
            test_config(PortRange { min: 44600, max: 44700 }),
            Arc::clone(&host) as Arc<dyn HostCallbacks>,
        )
        .unwrap();
        bridge.create_session(3).unwrap();
        bridge
            .handle_message(3, "txn-err", Some(json!({"request": "bogus"})), None)
            .unwrap();

        let (_, _, event, _) =
            tokio::time::timeout(std::time::Duration::from_secs(2), pushed_rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(event["error_code"], 442);
        bridge.destroy().await;
    }

    #[tokio::test]
    async fn test_ipv4_local_ip_disables_ipv6() {
        let (host, _pushed_rx) = MockHost::new();
        let mut config = test_config(PortRange { min: 44700, max: 44800 });
        config.general.local_ip = Some("127.0.0.1".to_string());
        let bridge =
            RtpBridge::new(config, Arc::clone(&host) as Arc<dyn HostCallbacks>).unwrap();
        assert!(bridge.ipv6_disabled());
        assert_eq!(bridge.local_ip(), Some("127.0.0.1".parse().unwrap()));
        // sdp_ip wins over local_ip for the advertised address.
        assert_eq!(bridge.advertised_ip(), "192.0.2.5");
        bridge.destroy().await;
    }

    #[tokio::test]
    async fn test_hangup_media_without_relay_cleans_up() {
        let (host, _pushed_rx) = MockHost::new();
        let bridge = RtpBridge::new(
            test_config(PortRange { min: 44800, max: 44900 }),
            Arc::clone(&host) as Arc<dyn HostCallbacks>,
        )
        .unwrap();
        bridge.create_session(5).unwrap();
        let session = bridge.registry.get(5).unwrap();
        {
            let mut media = session.media.lock().await;
            media.audio.active = true;
            media.audio.local_rtp_port = 44810;
        }
        bridge.hangup_media(5).await;
        let media = session.media.lock().await;
        assert_eq!(media.audio.local_rtp_port, 0);
        assert!(!session.is_hanging_up());
        drop(media);
        bridge.destroy().await;
    }
}
