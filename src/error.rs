use thiserror::Error;

/// Every fatal or per-packet error the core can raise.
///
/// Fatal variants (`ConfigInvalid`, `ConnectFailed`, `ProtocolError`, `AuthFailed`,
/// `TransportError`, `Cancelled`) propagate to the orchestrator and end the run.
/// The remaining variants are always local to one packet: the caller logs them
/// at `warn` and continues.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to connect after retries: {0}")]
    ConnectFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("malformed interleaved frame: {0}")]
    MalformedFrame(String),

    #[error("malformed RTP packet: {0}")]
    MalformedRtp(String),

    #[error("depacketization error: {0}")]
    DepacketizationError(String),

    #[error("fragment lost, discarding in-progress access unit")]
    FragmentLost,

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
