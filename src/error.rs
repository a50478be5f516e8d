use thiserror::Error;

/// Errors surfaced by sinks, sessions, and the registry.
///
/// Configuration and state errors are synchronous and final; the core never
/// retries. I/O errors additionally reach the owning remote client as an
/// [`ClientEvent::Error`](crate::session::ClientEvent) notification, and
/// leave the sink in a failed state that requires close/reopen.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("unsupported configuration: {0}")]
    Config(String),

    #[error("cannot {op} while {state}")]
    State { op: &'static str, state: &'static str },

    #[error("resource allocation failed: {0}")]
    Resource(String),

    #[error("device i/o failure: {0}")]
    Io(String),

    #[error("capture buffer would exceed its {limit} byte ceiling")]
    ResourceExhausted { limit: usize },

    #[error("operation not supported by this sink")]
    Unsupported,

    #[error("decode failed with code {code}")]
    DecodeFailed { code: i32 },
}

pub type Result<T> = std::result::Result<T, AudioError>;
