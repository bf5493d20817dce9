//! SDES-SRTP contexts for the peer leg
//!
//! Keys are exchanged in cleartext `a=crypto` lines: the local side generates
//! a random master key+salt and advertises it base64-encoded, the remote side
//! hands us its own the same way. One context protects what we send to the
//! peer, a second unprotects what the peer sends us, per medium.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use rand::RngCore;
use tracing::debug;
use webrtc_srtp::context::Context;
use webrtc_srtp::option::{srtcp_replay_protection, srtp_replay_protection};
use webrtc_srtp::protection_profile::ProtectionProfile;

use crate::protocols::rtp;
use crate::{Error, Result};

const REPLAY_WINDOW: usize = 128;

/// Negotiable SRTP crypto suites.
///
/// Key sizing per suite (key/salt/master bytes). Note the SHA1_32 suite
/// truncates the auth tag on RTP only; its RTCP policy keeps the full
/// 80-bit tag, which the backing profile implements.
///
/// | suite                   | key | salt | master |
/// |-------------------------|-----|------|--------|
/// | AES_CM_128_HMAC_SHA1_32 | 16  | 14   | 30     |
/// | AES_CM_128_HMAC_SHA1_80 | 16  | 14   | 30     |
/// | AEAD_AES_128_GCM        | 16  | 12   | 28     |
/// | AEAD_AES_256_GCM        | 32  | 12   | 44     |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpProfile {
    AesCm128HmacSha1_32,
    AesCm128HmacSha1_80,
    AeadAes128Gcm,
    AeadAes256Gcm,
}

impl SrtpProfile {
    /// Parse a crypto-suite token as it appears in `a=crypto` lines.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("AES_CM_128_HMAC_SHA1_32") {
            Some(Self::AesCm128HmacSha1_32)
        } else if name.eq_ignore_ascii_case("AES_CM_128_HMAC_SHA1_80") {
            Some(Self::AesCm128HmacSha1_80)
        } else if name.eq_ignore_ascii_case("AEAD_AES_128_GCM") {
            Some(Self::AeadAes128Gcm)
        } else if name.eq_ignore_ascii_case("AEAD_AES_256_GCM") {
            Some(Self::AeadAes256Gcm)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AesCm128HmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
            Self::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            Self::AeadAes128Gcm => "AEAD_AES_128_GCM",
            Self::AeadAes256Gcm => "AEAD_AES_256_GCM",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            Self::AesCm128HmacSha1_32 | Self::AesCm128HmacSha1_80 => 16,
            Self::AeadAes128Gcm => 16,
            Self::AeadAes256Gcm => 32,
        }
    }

    pub fn salt_len(&self) -> usize {
        match self {
            Self::AesCm128HmacSha1_32 | Self::AesCm128HmacSha1_80 => 14,
            Self::AeadAes128Gcm | Self::AeadAes256Gcm => 12,
        }
    }

    /// Length of the concatenated key+salt carried in the crypto line.
    pub fn master_len(&self) -> usize {
        self.key_len() + self.salt_len()
    }

    fn protection(&self) -> ProtectionProfile {
        match self {
            Self::AesCm128HmacSha1_32 => ProtectionProfile::Aes128CmHmacSha1_32,
            Self::AesCm128HmacSha1_80 => ProtectionProfile::Aes128CmHmacSha1_80,
            Self::AeadAes128Gcm => ProtectionProfile::AeadAes128Gcm,
            Self::AeadAes256Gcm => ProtectionProfile::AeadAes256Gcm,
        }
    }
}

/// One direction of SRTP for one medium.
pub struct SrtpContext {
    profile: SrtpProfile,
    context: Context,
}

impl std::fmt::Debug for SrtpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpContext")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl SrtpContext {
    fn with_master(profile: SrtpProfile, master: &[u8]) -> Result<Self> {
        let (key, salt) = master.split_at(profile.key_len());
        let context = Context::new(
            key,
            salt,
            profile.protection(),
            Some(srtp_replay_protection(REPLAY_WINDOW)),
            Some(srtcp_replay_protection(REPLAY_WINDOW)),
        )
        .map_err(|e| Error::srtp(format!("Failed to create SRTP context: {e}")))?;
        Ok(Self { profile, context })
    }

    /// Create the outbound context for a medium: generates a fresh master
    /// key+salt and returns it base64-encoded for the crypto line.
    pub fn new_outbound(profile: SrtpProfile) -> Result<(Self, String)> {
        let mut master = vec![0u8; profile.master_len()];
        rand::thread_rng().fill_bytes(&mut master);
        let context = Self::with_master(profile, &master)?;
        Ok((context, BASE64.encode(&master)))
    }

    /// Create the inbound context from the peer's crypto line material.
    pub fn new_inbound(profile: SrtpProfile, crypto: &str) -> Result<Self> {
        let master = BASE64
            .decode(crypto)
            .map_err(|e| Error::invalid_sdp(format!("Invalid base64 in crypto attribute: {e}")))?;
        if master.len() < profile.master_len() {
            return Err(Error::invalid_sdp(format!(
                "Crypto key too short for {}: got {}, need {}",
                profile.name(),
                master.len(),
                profile.master_len()
            )));
        }
        Self::with_master(profile, &master[..profile.master_len()])
    }

    pub fn profile(&self) -> SrtpProfile {
        self.profile
    }

    pub fn protect_rtp(&mut self, buf: &[u8]) -> Result<Bytes> {
        self.context
            .encrypt_rtp(buf)
            .map_err(|e| Error::srtp(format!("SRTP protect error: {e}")))
    }

    pub fn protect_rtcp(&mut self, buf: &[u8]) -> Result<Bytes> {
        self.context
            .encrypt_rtcp(buf)
            .map_err(|e| Error::srtp(format!("SRTCP protect error: {e}")))
    }

    /// Unprotect an inbound SRTP packet. Failures (including replayed
    /// packets rejected by the anti-replay window) drop the packet without
    /// tearing anything down.
    pub fn unprotect_rtp(&mut self, buf: &[u8], video: bool) -> Option<Bytes> {
        match self.context.decrypt_rtp(buf) {
            Ok(plain) => Some(plain),
            Err(e) => {
                debug!(
                    "{} SRTP unprotect error: {} (len={}, ssrc={}, seq={}, ts={})",
                    if video { "Video" } else { "Audio" },
                    e,
                    buf.len(),
                    rtp::ssrc(buf),
                    rtp::sequence_number(buf),
                    rtp::timestamp(buf),
                );
                None
            }
        }
    }

    pub fn unprotect_rtcp(&mut self, buf: &[u8], video: bool) -> Option<Bytes> {
        match self.context.decrypt_rtcp(buf) {
            Ok(plain) => Some(plain),
            Err(e) => {
                debug!(
                    "{} SRTCP unprotect error: {} (len={})",
                    if video { "Video" } else { "Audio" },
                    e,
                    buf.len(),
                );
                None
            }
        }
    }
}
