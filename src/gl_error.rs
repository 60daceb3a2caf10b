use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::gl_interface::Iteration;

pub type Result<T> = std::result::Result<T, GlError>;

/// Failures across registration, relay and round handling
#[derive(Debug, Error)]
pub enum GlError {
    /// All N identities are handed out; fatal for the registering peer only
    #[error("registration closed: all peers already registered")]
    RegistrationClosed,

    /// Datagram or frame that does not decode; the relay drops it and continues
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Round gave up waiting for acknowledgments (non-fatal)
    #[error("round {iteration} timed out waiting for acknowledgments")]
    RoundTimeout { iteration: Iteration },

    /// Datagram from an address that never registered
    #[error("unknown peer at {0}")]
    UnknownPeer(SocketAddr),

    /// Socket or internal channel went away underneath its owner
    #[error("channel closed")]
    ChannelClosed,

    /// Rejected before any socket is opened
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Message kind not allowed in the current state
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl GlError {
    /// Socket read timeouts surface as `WouldBlock` or `TimedOut` depending on platform
    pub fn is_timeout(&self) -> bool {
        match self {
            GlError::Io(e) => is_timeout(e),
            GlError::RoundTimeout { .. } => true,
            _ => false,
        }
    }
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_timeout() {
        assert!(GlError::RoundTimeout { iteration: 3 }.is_timeout());
        assert!(GlError::from(io::Error::from(io::ErrorKind::WouldBlock)).is_timeout());
        assert!(GlError::from(io::Error::from(io::ErrorKind::TimedOut)).is_timeout());

        assert!(!GlError::from(io::Error::from(io::ErrorKind::ConnectionRefused)).is_timeout());
        assert!(!GlError::RegistrationClosed.is_timeout());
        assert!(!GlError::ProtocolViolation("expected START".into()).is_timeout());
    }
}
