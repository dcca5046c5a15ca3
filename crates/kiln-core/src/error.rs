use kiln_types::InstanceId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid instance: {0}")]
    InvalidInstance(InstanceId),

    #[error("Missing target: {0}")]
    MissingTarget(String),

    #[error("Unsupported target: {0}")]
    UnsupportedTarget(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0}")]
    OperationFailed(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_instance() {
        let err = Error::InvalidInstance(InstanceId(9));
        assert_eq!(err.to_string(), "Invalid instance: 9");
    }

    #[test]
    fn test_operation_failed_is_bare_cause() {
        let err = Error::OperationFailed("Platform not found: acme:avr".to_string());
        assert_eq!(err.to_string(), "Platform not found: acme:avr");
    }

    #[test]
    fn test_error_display_timeout() {
        assert_eq!(Error::Timeout(250).to_string(), "Timed out after 250 ms");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<i32>("\"not a number\"").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_error() -> Result<()> {
            Err(Error::Cancelled)
        }
        assert!(returns_error().is_err());
    }
}
