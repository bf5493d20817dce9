//! Local RTP/RTCP port-pair allocation
//!
//! One allocator per plugin instance hands out even/odd UDP port pairs from
//! the configured range, binding both sockets before a pair is considered
//! taken. A wrap-around cursor remembers where the last allocation ended so
//! consecutive sessions spread across the range instead of racing for the
//! bottom of it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::PortRange;
use crate::{Error, Result};

/// A bound RTP/RTCP socket pair, RTP on the even port.
#[derive(Debug)]
pub struct PortPair {
    pub rtp_socket: Arc<UdpSocket>,
    pub rtcp_socket: Arc<UdpSocket>,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

pub struct PortAllocator {
    range: PortRange,
    cursor: Mutex<u16>,
    bind_ip: Option<IpAddr>,
    use_ipv6: bool,
    dscp_audio_rtp: u8,
    dscp_video_rtp: u8,
}

impl PortAllocator {
    pub fn new(
        range: PortRange,
        bind_ip: Option<IpAddr>,
        use_ipv6: bool,
        dscp_audio_rtp: u8,
        dscp_video_rtp: u8,
    ) -> Self {
        let range = range.normalized();
        Self {
            cursor: Mutex::new(range.min),
            range,
            bind_ip,
            use_ipv6,
            dscp_audio_rtp,
            dscp_video_rtp,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    fn make_socket(&self, dscp: u8) -> Result<Socket> {
        let domain = if self.use_ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if self.use_ipv6 {
            if let Err(e) = socket.set_only_v6(false) {
                warn!("Error clearing v6only on media socket: {e}");
            }
        }
        if dscp > 0 {
            let tos = u32::from(dscp) << 2;
            if let Err(e) = socket.set_tos(tos) {
                warn!("Error setting IP_TOS {tos} on RTP socket: {e}");
            }
        }
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn bind_addr(&self, port: u16) -> SocketAddr {
        let ip = self.bind_ip.unwrap_or(if self.use_ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        SocketAddr::new(ip, port)
    }

    /// Allocate and bind an even/odd port pair for one medium.
    ///
    /// Must run inside a tokio runtime; the bound sockets are registered
    /// with the reactor before being returned.
    pub fn allocate_pair(&self, video: bool) -> Result<PortPair> {
        let dscp = if video { self.dscp_video_rtp } else { self.dscp_audio_rtp };
        let mut cursor = self.cursor.lock().unwrap();
        let start = *cursor;
        let mut wrapped = false;

        // Sockets survive a failed bind attempt: a socket that did not bind
        // is still fresh and can try the next candidate port.
        let mut rtp_socket: Option<Socket> = None;
        let mut rtcp_socket: Option<Socket> = None;

        loop {
            if wrapped && *cursor >= start {
                return Err(Error::network(format!(
                    "No ports available for {} channel in range {}-{}",
                    if video { "video" } else { "audio" },
                    self.range.min,
                    self.range.max
                )));
            }
            let rtp_port = *cursor;
            let rtcp_port = rtp_port + 1;
            if u32::from(rtp_port) + 2 < u32::from(self.range.max) {
                *cursor += 2;
            } else {
                *cursor = self.range.min;
                wrapped = true;
            }

            let rtp = match rtp_socket.take() {
                Some(socket) => socket,
                None => self.make_socket(dscp)?,
            };
            let rtcp = match rtcp_socket.take() {
                Some(socket) => socket,
                None => self.make_socket(0)?,
            };

            if rtp.bind(&self.bind_addr(rtp_port).into()).is_err() {
                // RTP port taken; the socket is still unbound, keep it.
                rtp_socket = Some(rtp);
                rtcp_socket = Some(rtcp);
                continue;
            }
            if rtcp.bind(&self.bind_addr(rtcp_port).into()).is_err() {
                // The RTP socket bound but its sibling port is taken; only
                // the unbound RTCP socket can be reused.
                rtcp_socket = Some(rtcp);
                continue;
            }

            debug!(
                "{} RTP/RTCP pair bound to ports {}/{}",
                if video { "Video" } else { "Audio" },
                rtp_port,
                rtcp_port
            );
            return Ok(PortPair {
                rtp_socket: Arc::new(UdpSocket::from_std(rtp.into())?),
                rtcp_socket: Arc::new(UdpSocket::from_std(rtcp.into())?),
                rtp_port,
                rtcp_port,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(min: u16, max: u16) -> PortAllocator {
        PortAllocator::new(PortRange { min, max }, None, false, 0, 0)
    }

    #[tokio::test]
    async fn test_allocate_pair_even_odd() {
        let ports = allocator(41000, 41100);
        let pair = ports.allocate_pair(false).unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(pair.rtcp_port, pair.rtp_port + 1);
        assert_eq!(
            pair.rtp_socket.local_addr().unwrap().port(),
            pair.rtp_port
        );
        assert_eq!(
            pair.rtcp_socket.local_addr().unwrap().port(),
            pair.rtcp_port
        );
    }

    #[tokio::test]
    async fn test_allocate_pairs_do_not_collide() {
        let ports = allocator(41200, 41300);
        let a = ports.allocate_pair(false).unwrap();
        let b = ports.allocate_pair(true).unwrap();
        assert_ne!(a.rtp_port, b.rtp_port);
    }

    #[tokio::test]
    async fn test_cursor_skips_busy_pair() {
        let ports = allocator(41400, 41500);
        // Occupy the first RTP port so the allocator has to move on.
        let blocker = std::net::UdpSocket::bind("0.0.0.0:41400").unwrap();
        let pair = ports.allocate_pair(false).unwrap();
        assert_ne!(pair.rtp_port, 41400);
        assert_eq!(pair.rtp_port % 2, 0);
        drop(blocker);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_error() {
        let ports = allocator(41600, 41603);
        let _a = ports.allocate_pair(false).unwrap();
        let _b = ports.allocate_pair(false).unwrap();
        let err = ports.allocate_pair(false).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::IO_ERROR);
    }

    #[tokio::test]
    async fn test_cursor_wraps_to_minimum() {
        let ports = allocator(41700, 41703);
        let a = ports.allocate_pair(false).unwrap();
        let b = ports.allocate_pair(false).unwrap();
        assert_eq!(a.rtp_port, 41700);
        assert_eq!(b.rtp_port, 41702);
        drop(a);
        drop(b);
        // Previous pairs were dropped, so wrapping around finds them free.
        let c = ports.allocate_pair(false).unwrap();
        assert_eq!(c.rtp_port, 41700);
    }
}
