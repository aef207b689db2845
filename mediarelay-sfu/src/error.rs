use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("SSRC {0} is already registered with this transport")]
    SsrcConflict(u32),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Errors a caller can usually log and move past.
    ///
    /// Id collisions and operations racing a teardown leave the routing state
    /// consistent, so they never need to abort the surrounding operation.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::DuplicateId(_) | Self::StaleReference(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::DuplicateId("t".into()).is_recoverable());
        assert!(Error::StaleReference("s".into()).is_recoverable());
        assert!(!Error::ResourceExhaustion("full".into()).is_recoverable());
        assert!(!Error::SsrcConflict(1).is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::SsrcConflict(1111).to_string(),
            "SSRC 1111 is already registered with this transport"
        );
        assert_eq!(
            Error::DuplicateId("video-0".into()).to_string(),
            "Duplicate id: video-0"
        );
    }
}
