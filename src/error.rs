//! Error handling for the RTP bridge plugin

pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error codes pushed back to the application alongside the
/// human-readable reason.
pub mod codes {
    pub const UNKNOWN_ERROR: u16 = 499;
    pub const NO_MESSAGE: u16 = 440;
    pub const INVALID_JSON: u16 = 441;
    pub const INVALID_REQUEST: u16 = 442;
    pub const MISSING_ELEMENT: u16 = 443;
    pub const INVALID_ELEMENT: u16 = 444;
    pub const WRONG_STATE: u16 = 445;
    pub const MISSING_SDP: u16 = 446;
    pub const INVALID_SDP: u16 = 447;
    pub const IO_ERROR: u16 = 448;
    pub const RECORDING_ERROR: u16 = 449;
    pub const TOO_STRICT: u16 = 450;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("No message")]
    NoMessage,

    #[error("JSON error: {0}")]
    InvalidJson(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing element: {0}")]
    MissingElement(String),

    #[error("Invalid element: {0}")]
    InvalidElement(String),

    #[error("Wrong state: {0}")]
    WrongState(String),

    #[error("{0}")]
    MissingSdp(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("{0}")]
    TooStrict(String),

    #[error("SRTP error: {0}")]
    Srtp(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn invalid_element<S: Into<String>>(msg: S) -> Self {
        Self::InvalidElement(msg.into())
    }

    pub fn wrong_state<S: Into<String>>(msg: S) -> Self {
        Self::WrongState(msg.into())
    }

    pub fn missing_sdp<S: Into<String>>(msg: S) -> Self {
        Self::MissingSdp(msg.into())
    }

    pub fn invalid_sdp<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSdp(msg.into())
    }

    pub fn recording<S: Into<String>>(msg: S) -> Self {
        Self::Recording(msg.into())
    }

    pub fn too_strict<S: Into<String>>(msg: S) -> Self {
        Self::TooStrict(msg.into())
    }

    pub fn srtp<S: Into<String>>(msg: S) -> Self {
        Self::Srtp(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// The numeric code reported in asynchronous error events.
    pub fn code(&self) -> u16 {
        match self {
            Error::NoMessage => codes::NO_MESSAGE,
            Error::InvalidJson(_) => codes::INVALID_JSON,
            Error::InvalidRequest(_) => codes::INVALID_REQUEST,
            Error::MissingElement(_) => codes::MISSING_ELEMENT,
            Error::InvalidElement(_) => codes::INVALID_ELEMENT,
            Error::WrongState(_) => codes::WRONG_STATE,
            Error::MissingSdp(_) => codes::MISSING_SDP,
            Error::InvalidSdp(_) => codes::INVALID_SDP,
            Error::Io(_) | Error::Network(_) => codes::IO_ERROR,
            Error::Recording(_) => codes::RECORDING_ERROR,
            Error::TooStrict(_) => codes::TOO_STRICT,
            Error::Config(_) | Error::Srtp(_) | Error::Internal(_) => codes::UNKNOWN_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidJson(e.to_string())
    }
}
