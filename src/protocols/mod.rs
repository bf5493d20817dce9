//! Media protocol support for the RTP bridge plugin

pub mod rtcp;
pub mod rtp;
pub mod sdp;
pub mod srtp;

pub use rtp::RtpSwitchingContext;
pub use srtp::{SrtpContext, SrtpProfile};
