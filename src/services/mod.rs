//! Services module for the RTP bridge plugin

pub mod ports;
pub mod recording;
pub mod relay;
pub mod requests;
pub mod session;

pub use ports::{PortAllocator, PortPair};
pub use recording::Recorder;
pub use requests::{PendingRequest, RequestContext};
pub use session::{MediaSession, MediaStream, Session, SessionRegistry};
