//! Tunnel controller errors.

use crate::device::InterfaceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// A control operation was called in a state it is not valid in.
    #[error("Wrong tunnel state: {0}")]
    InvalidState(&'static str),

    #[error("No gateway configured")]
    NoGateway,

    #[error("No permission to open the virtual interface")]
    NoPermissions,

    #[error("Could not establish interface: {0}")]
    Interface(String),

    #[error("Engine error: {0}")]
    Engine(#[from] veil_engine::EngineError),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<InterfaceError> for TunnelError {
    fn from(err: InterfaceError) -> Self {
        match err {
            InterfaceError::NoPermissions => TunnelError::NoPermissions,
            InterfaceError::Establish(reason) => TunnelError::Interface(reason),
        }
    }
}
