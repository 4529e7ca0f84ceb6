//! Failure classification shared by the ingest and storage layers.

/// Who is at fault for a failed operation.
///
/// Server failures are retryable and surface as HTTP 500 to API callers;
/// client failures are not retryable and surface as HTTP 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Server,
    Client,
}

impl FailureKind {
    /// HTTP status code reported for this kind of failure.
    pub fn status_code(self) -> u16 {
        match self {
            Self::Server => 500,
            Self::Client => 400,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Server)
    }

    /// Label used in metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(FailureKind::Server.status_code(), 500);
        assert_eq!(FailureKind::Client.status_code(), 400);
        assert!(FailureKind::Server.is_retryable());
        assert!(!FailureKind::Client.is_retryable());
    }
}
