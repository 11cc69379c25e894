use thiserror::Error;

/// Errors raised while isolating or decoding a single BER frame from a
/// socket. `Closed` is a clean disconnect at a message boundary and is not
/// logged as an error; `Truncated` and `Malformed` are.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed at a message boundary")]
    Closed,
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("malformed BER length encoding")]
    Malformed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised by a filter's own body. Per the filter contract, this is
/// always non-fatal to the pair: the offending filter is skipped and the
/// message passes through unmodified.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct FilterError(pub String);

impl FilterError {
    pub fn new(msg: impl Into<String>) -> Self {
        FilterError(msg.into())
    }
}

/// The error kinds from the error-handling design: one variant per row of
/// the policy table. Only `FilterCorruptedEncoding` (when `filtervalidate`
/// is enabled) and `UpstreamDialFailed`/frame errors are fatal to a pair;
/// the rest are logged and either skipped or answered without tearing the
/// pair down.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("frame truncated mid-message")]
    FrameTruncated,
    #[error("malformed BER frame")]
    FrameMalformed,
    #[error("upstream dial failed: {0}")]
    UpstreamDialFailed(String),
    #[error("unsupported extended operation: {0}")]
    UnsupportedExtended(String),
    #[error("filter raised: {0}")]
    FilterRaised(String),
    #[error("filter corrupted message encoding")]
    FilterCorruptedEncoding,
    #[error("config reload failed: {0}")]
    ConfigReloadFailed(String),
    #[error("overlay file malformed: {0}")]
    OverlayFileMalformed(String),
    #[error("listener bind failed: {0}")]
    ListenBindFailed(String),
    #[error("protocol sequence error: {0}")]
    InvalidProtocolState(String),
    #[error("idle timeout waiting for next message")]
    IdleTimeout,
}

impl From<FrameError> for ProxyError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Closed | FrameError::Truncated => ProxyError::FrameTruncated,
            FrameError::Malformed | FrameError::Io(_) => ProxyError::FrameMalformed,
        }
    }
}
