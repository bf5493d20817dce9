//! WebRTC to plain-RTP bridging plugin.
//!
//! The plugin takes care of nothing but media: the embedding application
//! performs its own signalling (SIP, XMPP, IAX, anything), hands the plugin a
//! WebRTC session description, and gets back a plain `RTP/AVP`-or-`RTP/SAVP`
//! description it can forward to a legacy peer. Symmetrically, the peer's
//! plain description is processed into a WebRTC-usable one. Once both sides
//! are known the plugin relays RTP/RTCP in both directions, optionally with
//! SDES-SRTP, per-direction recording, and programmatic PLI keyframe
//! requests.

pub mod config;
pub mod error;
pub mod host;
pub mod plugin;
pub mod protocols;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
pub use plugin::RtpBridge;

/// Plugin version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
