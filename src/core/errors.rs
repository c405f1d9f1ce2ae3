//! Core error types

use thiserror::Error;

/// Core runtime errors
///
/// Would-block conditions never show up here: the connection layer reports
/// them through [`ReadStatus`](crate::core::connection::ReadStatus) and
/// [`FlushStatus`](crate::core::connection::FlushStatus) instead.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Ring buffer overflow ({size} bytes buffered, capacity {capacity})")]
    BufferOverflow { size: usize, capacity: usize },

    #[error("Too many file descriptors queued (capacity {0})")]
    FdOverflow(usize),

    #[error("Outgoing fd queue full (capacity {0}), peer not reading")]
    FdQueueFull(usize),

    #[error("Data too big for buffer ({size} > {capacity})")]
    MessageTooLarge { size: usize, capacity: usize },

    #[error("Malformed wire message: {0}")]
    MalformedMessage(String),

    #[error("Wayland protocol error: {0}")]
    Protocol(String),

    #[error("Handler consumed {consumed} of {size} message bytes")]
    ShortConsume { consumed: usize, size: usize },

    #[error("XDG_RUNTIME_DIR is not set")]
    RuntimeDirUnset,

    #[error("Socket path too long: {0}")]
    SocketNameTooLong(String),

    #[error("Socket already in use: {0}")]
    SocketInUse(String),

    #[error("No free display socket name (probed {0} candidates)")]
    NoFreeSocketName(u32),

    #[error("{0} client(s) created during teardown could not be destroyed")]
    ClientsRemaining(usize),

    #[error("Invalid client ID: {0}")]
    InvalidClient(u64),

    #[error("Invalid event source: {0}")]
    InvalidSource(u64),
}

impl CoreError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// True for errors caused by what a peer sent us.
    ///
    /// These are fatal to that one client and never to the display.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::BufferOverflow { .. }
                | Self::FdOverflow(_)
                | Self::MessageTooLarge { .. }
                | Self::MalformedMessage(_)
                | Self::Protocol(_)
                | Self::ShortConsume { .. }
        )
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_classification() {
        assert!(CoreError::protocol("bad opcode").is_protocol_violation());
        assert!(CoreError::FdOverflow(28).is_protocol_violation());
        assert!(CoreError::BufferOverflow { size: 4096, capacity: 4096 }.is_protocol_violation());
        assert!(!CoreError::RuntimeDirUnset.is_protocol_violation());
        assert!(!CoreError::NoFreeSocketName(33).is_protocol_violation());
        assert!(!CoreError::FdQueueFull(1024).is_protocol_violation());
    }

    #[test]
    fn test_error_messages() {
        let err = CoreError::MessageTooLarge { size: 5000, capacity: 4096 };
        assert_eq!(err.to_string(), "Data too big for buffer (5000 > 4096)");
        let err = CoreError::ClientsRemaining(2);
        assert!(err.to_string().contains("2 client(s)"));
    }
}
