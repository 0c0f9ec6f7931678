use thiserror::Error;

/// Error types for the tunnel system
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Keepalive timeout: no PING_OK received")]
    Timeout,

    #[error("Local service unavailable: {0}")]
    LocalServiceUnavailable(String),

    #[error("Stream closed: {0}")]
    StreamClosed(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::InvalidMessage("test".to_string());
        assert_eq!(err.to_string(), "Invalid message format: test");

        let err = TunnelError::UnknownCommand(42);
        assert_eq!(err.to_string(), "Unknown command: 42");

        let err = TunnelError::Timeout;
        assert_eq!(err.to_string(), "Keepalive timeout: no PING_OK received");
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_err.is_err());

        let tunnel_err: TunnelError = json_err.unwrap_err().into();
        assert!(matches!(tunnel_err, TunnelError::SerializationError(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let tunnel_err: TunnelError = io_err.into();
        assert!(matches!(tunnel_err, TunnelError::Io(_)));
    }
}
