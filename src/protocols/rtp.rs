//! RTP packet inspection and rewriting helpers
//!
//! The relay never re-serializes packets: it patches the fields it needs
//! (SSRC, sequence, timestamp) directly in the datagram buffer and forwards
//! the bytes untouched otherwise. These helpers operate on raw buffers for
//! that reason.

use bytes::{Buf, Bytes, BytesMut};

use crate::{Error, Result};

pub const RTP_HEADER_LEN: usize = 12;

/// URI of the ssrc-audio-level header extension (RFC 6464).
pub const EXTMAP_AUDIO_LEVEL: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
/// URI of the 3GPP video-orientation header extension.
pub const EXTMAP_VIDEO_ORIENTATION: &str = "urn:3gpp:video-orientation";

/// Quick sanity check that a datagram looks like RTP: version 2 and a
/// payload type outside the range RTCP packet types occupy.
pub fn looks_like_rtp(buf: &[u8]) -> bool {
    if buf.len() < RTP_HEADER_LEN || (buf[0] >> 6) != 2 {
        return false;
    }
    !(64..=95).contains(&(buf[1] & 0x7f))
}

pub fn payload_type(buf: &[u8]) -> u8 {
    buf[1] & 0x7f
}

pub fn sequence_number(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[2], buf[3]])
}

pub fn timestamp(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]])
}

pub fn ssrc(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]])
}

pub fn set_sequence_number(buf: &mut [u8], seq: u16) {
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
}

pub fn set_timestamp(buf: &mut [u8], ts: u32) {
    buf[4..8].copy_from_slice(&ts.to_be_bytes());
}

pub fn set_ssrc(buf: &mut [u8], ssrc: u32) {
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
}

/// Timestamp step assumed when rebasing across an SSRC change: 20 ms of
/// 48 kHz audio, or a frame of 90 kHz video at 20 fps.
const AUDIO_TS_STEP: u32 = 960;
const VIDEO_TS_STEP: u32 = 4500;

/// Per-medium state used to keep relayed sequence numbers and timestamps
/// monotonic across SSRC changes on the originating side (e.g., after the
/// peer renegotiates and starts a fresh stream).
#[derive(Debug, Clone, Copy, Default)]
pub struct RtpSwitchingContext {
    started: bool,
    last_ssrc: u32,
    seq_offset: u16,
    ts_offset: u32,
    last_seq: u16,
    last_ts: u32,
}

impl RtpSwitchingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Update the context with a packet and rewrite its sequence/timestamp
    /// in place so the stream continues where the previous SSRC left off.
    pub fn update(&mut self, buf: &mut [u8], video: bool) {
        let pkt_ssrc = ssrc(buf);
        let seq = sequence_number(buf);
        let ts = timestamp(buf);

        if !self.started {
            self.started = true;
            self.last_ssrc = pkt_ssrc;
        } else if pkt_ssrc != self.last_ssrc {
            let step = if video { VIDEO_TS_STEP } else { AUDIO_TS_STEP };
            self.last_ssrc = pkt_ssrc;
            self.seq_offset = self.last_seq.wrapping_add(1).wrapping_sub(seq);
            self.ts_offset = self.last_ts.wrapping_add(step).wrapping_sub(ts);
        }

        let new_seq = seq.wrapping_add(self.seq_offset);
        let new_ts = ts.wrapping_add(self.ts_offset);
        set_sequence_number(buf, new_seq);
        set_timestamp(buf, new_ts);
        self.last_seq = new_seq;
        self.last_ts = new_ts;
    }
}

/// Locate a one-byte header extension (RFC 8285) element by id and return
/// its payload.
fn find_one_byte_extension(buf: &[u8], id: u8) -> Option<&[u8]> {
    if buf.len() < RTP_HEADER_LEN || buf[0] & 0x10 == 0 || !(1..=14).contains(&id) {
        return None;
    }
    let csrc_count = (buf[0] & 0x0f) as usize;
    let ext_start = RTP_HEADER_LEN + csrc_count * 4;
    if buf.len() < ext_start + 4 {
        return None;
    }
    let profile = u16::from_be_bytes([buf[ext_start], buf[ext_start + 1]]);
    if profile != 0xbede {
        return None;
    }
    let words = u16::from_be_bytes([buf[ext_start + 2], buf[ext_start + 3]]) as usize;
    let data = buf.get(ext_start + 4..ext_start + 4 + words * 4)?;

    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        if byte == 0 {
            i += 1;
            continue;
        }
        let elem_id = byte >> 4;
        let elem_len = (byte & 0x0f) as usize + 1;
        if elem_id == 15 {
            return None;
        }
        let payload = data.get(i + 1..i + 1 + elem_len)?;
        if elem_id == id {
            return Some(payload);
        }
        i += 1 + elem_len;
    }
    None
}

/// Parse the ssrc-audio-level extension: voice-activity flag plus the level
/// in -dBov.
pub fn parse_audio_level(buf: &[u8], id: i32) -> Option<(bool, u8)> {
    let id = u8::try_from(id).ok()?;
    let payload = find_one_byte_extension(buf, id)?;
    let byte = *payload.first()?;
    Some((byte & 0x80 != 0, byte & 0x7f))
}

/// Parse the 3GPP video-orientation extension into its raw (c, f, r1, r0)
/// bits: camera, flip, and the two rotation bits.
pub fn parse_video_orientation(buf: &[u8], id: i32) -> Option<(bool, bool, bool, bool)> {
    let id = u8::try_from(id).ok()?;
    let payload = find_one_byte_extension(buf, id)?;
    let byte = *payload.first()?;
    Some((
        byte & 0x08 != 0,
        byte & 0x04 != 0,
        byte & 0x02 != 0,
        byte & 0x01 != 0,
    ))
}

/// Rotation in degrees encoded by the (r1, r0) video-orientation bits.
pub fn rotation_degrees(r1: bool, r0: bool) -> u16 {
    match (r1, r0) {
        (true, true) => 270,
        (true, false) => 180,
        (false, true) => 90,
        (false, false) => 0,
    }
}

/// A decoded RTP packet, used by tests and diagnostics rather than on the
/// relay fast path.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&[
            (self.version << 6) | (u8::from(self.padding) << 5) | (u8::from(self.extension) << 4),
            (u8::from(self.marker) << 7) | self.payload_type,
        ]);
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::internal("RTP packet too short"));
        }
        let mut buf = Bytes::copy_from_slice(data);
        let first = buf.get_u8();
        let version = first >> 6;
        if version != 2 {
            return Err(Error::internal("Invalid RTP version"));
        }
        let second = buf.get_u8();
        Ok(Self {
            version,
            padding: first & 0x20 != 0,
            extension: first & 0x10 != 0,
            marker: second & 0x80 != 0,
            payload_type: second & 0x7f,
            sequence_number: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
            payload: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_packet(ssrc: u32, seq: u16, ts: u32) -> Vec<u8> {
        let mut packet = RtpPacket::new(111, seq, ts, ssrc);
        packet.payload = Bytes::from_static(b"payload");
        packet.encode()
    }

    #[test]
    fn test_rtp_packet_roundtrip() {
        let mut packet = RtpPacket::new(96, 12345, 67890, 0x1234_5678);
        packet.marker = true;
        packet.payload = Bytes::from_static(b"test payload");

        let decoded = RtpPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.payload_type, 96);
        assert_eq!(decoded.sequence_number, 12345);
        assert_eq!(decoded.timestamp, 67890);
        assert_eq!(decoded.ssrc, 0x1234_5678);
        assert!(decoded.marker);
        assert_eq!(&decoded.payload[..], b"test payload");
    }

    #[test]
    fn test_classification() {
        let rtp = test_packet(1, 1, 1);
        assert!(looks_like_rtp(&rtp));
        // A receiver report (PT 201) must not be mistaken for RTP.
        let rtcp = [0x80u8, 201, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2];
        assert!(!looks_like_rtp(&rtcp));
        assert!(!looks_like_rtp(&[0x80, 111]));
    }

    #[test]
    fn test_field_accessors() {
        let mut buf = test_packet(0xAABBCCDD, 100, 4000);
        assert_eq!(ssrc(&buf), 0xAABBCCDD);
        assert_eq!(sequence_number(&buf), 100);
        assert_eq!(timestamp(&buf), 4000);
        set_ssrc(&mut buf, 0x01020304);
        assert_eq!(ssrc(&buf), 0x01020304);
    }

    #[test]
    fn test_switching_context_passthrough() {
        // A single SSRC must flow through completely untouched.
        let mut context = RtpSwitchingContext::new();
        let mut buf = test_packet(10, 500, 16000);
        context.update(&mut buf, false);
        assert_eq!(sequence_number(&buf), 500);
        assert_eq!(timestamp(&buf), 16000);

        let mut buf = test_packet(10, 501, 16960);
        context.update(&mut buf, false);
        assert_eq!(sequence_number(&buf), 501);
        assert_eq!(timestamp(&buf), 16960);
    }

    #[test]
    fn test_switching_context_rebases_on_ssrc_change() {
        let mut context = RtpSwitchingContext::new();
        let mut buf = test_packet(10, 1000, 80000);
        context.update(&mut buf, false);

        // A new SSRC restarts its own numbering; the rewritten stream must
        // continue right after the last forwarded packet.
        let mut buf = test_packet(99, 7, 1234);
        context.update(&mut buf, false);
        assert_eq!(sequence_number(&buf), 1001);
        assert_eq!(timestamp(&buf), 80000 + 960);

        let mut buf = test_packet(99, 8, 1234 + 960);
        context.update(&mut buf, false);
        assert_eq!(sequence_number(&buf), 1002);
        assert_eq!(timestamp(&buf), 80000 + 2 * 960);
    }

    #[test]
    fn test_switching_context_wraps() {
        let mut context = RtpSwitchingContext::new();
        let mut buf = test_packet(10, u16::MAX, u32::MAX - 100);
        context.update(&mut buf, true);

        let mut buf = test_packet(11, 0, 0);
        context.update(&mut buf, true);
        assert_eq!(sequence_number(&buf), 0);
        assert_eq!(timestamp(&buf), (u32::MAX - 100).wrapping_add(4500));
    }

    fn packet_with_extension(ext_id: u8, ext_byte: u8) -> Vec<u8> {
        let mut buf = vec![
            0x90, 111, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, // header with X bit set
            0xbe, 0xde, 0, 1, // one-byte extension block, 1 word
            (ext_id << 4), ext_byte, 0, 0, // element + padding
        ];
        buf.extend_from_slice(b"data");
        buf
    }

    #[test]
    fn test_parse_audio_level() {
        let buf = packet_with_extension(3, 0x80 | 42);
        assert_eq!(parse_audio_level(&buf, 3), Some((true, 42)));
        assert_eq!(parse_audio_level(&buf, 5), None);
        assert_eq!(parse_audio_level(&buf, -1), None);
    }

    #[test]
    fn test_parse_video_orientation() {
        let buf = packet_with_extension(7, 0x08 | 0x02 | 0x01);
        let (c, f, r1, r0) = parse_video_orientation(&buf, 7).unwrap();
        assert!(c && !f && r1 && r0);
        assert_eq!(rotation_degrees(r1, r0), 270);
        assert_eq!(rotation_degrees(true, false), 180);
        assert_eq!(rotation_degrees(false, true), 90);
        assert_eq!(rotation_degrees(false, false), 0);
    }

    #[test]
    fn test_extension_absent_without_x_bit() {
        let buf = test_packet(1, 1, 1);
        assert_eq!(parse_audio_level(&buf, 3), None);
    }
}
