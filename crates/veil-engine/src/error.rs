//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the packet engine.
///
/// Packet-level problems (malformed input, a single failed send) never
/// appear here; those degrade to a log line and a recoverable-error count.
/// These are the failures a caller has to act on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Routed mode requires an encrypted transport")]
    MissingTransport,

    #[error("Malformed packet: {0}")]
    Malformed(String),
}
