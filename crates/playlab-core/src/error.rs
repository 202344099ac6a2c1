use std::time::Duration;

/// Error taxonomy for one playground run.
///
/// Every variant except `PortAllocation` is fatal: the run aborts after
/// best-effort teardown of whatever already started. Nothing here is ever
/// silently swallowed.
#[derive(Debug, thiserror::Error)]
pub enum PlayError {
    #[error("download failed: {0}")]
    Network(String),

    #[error("archive layout not recognized: {0}")]
    ArchiveFormat(String),

    #[error("could not allocate a local port: {0}")]
    PortAllocation(String),

    #[error("failed to start {service}: {reason}")]
    ProcessStart { service: String, reason: String },

    #[error("{service} exited during startup ({status})\n{log_tail}")]
    ServiceCrashed {
        service: String,
        status: String,
        log_tail: String,
    },

    #[error("timed out after {elapsed:?}: {what}\n{log_tail}")]
    Timeout {
        what: String,
        elapsed: Duration,
        log_tail: String,
    },

    #[error("config template malformed: {0}")]
    ConfigFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlayError {
    /// Whether the failure can be retried by simply asking again.
    ///
    /// Only a refused port bind qualifies; a fresh request to the OS gets a
    /// different ephemeral port.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlayError::PortAllocation(_))
    }

    pub fn timeout(what: impl Into<String>, elapsed: Duration) -> Self {
        PlayError::Timeout {
            what: what.into(),
            elapsed,
            log_tail: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_port_allocation_is_retryable() {
        assert!(PlayError::PortAllocation("bind refused".into()).is_retryable());
        assert!(!PlayError::Network("dns".into()).is_retryable());
        assert!(!PlayError::ArchiveFormat("truncated".into()).is_retryable());
        assert!(!PlayError::timeout("warm-up", Duration::from_secs(60)).is_retryable());
    }
}
