use thiserror::Error;

/// Errors the session engine can return. Wraps [`mqtt_core::Error`] (codec
/// and argument failures) with the session-level kinds spec.md §7 adds on
/// top: network, connection-state, and attach failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] mqtt_core::Error),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("not connected")]
    NotConnected,

    #[error("cannot connect: {0}")]
    CantConnect(String),

    #[error("cannot complete: {0}")]
    CantComplete(String),

    #[error("cannot write: {0}")]
    CantWrite(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_convert_via_from_and_display_transparently() {
        let core = mqtt_core::Error::BadArgs("bad".into());
        let message = core.to_string();
        let err: Error = core.into();
        assert_eq!(err.to_string(), message);
    }

    #[test]
    fn io_errors_convert_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::WouldBlock, "nope");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn network_and_connect_variants_format_their_payload() {
        assert_eq!(
            Error::Network("reset".into()).to_string(),
            "network error: reset"
        );
        assert_eq!(
            Error::CantConnect("refused".into()).to_string(),
            "cannot connect: refused"
        );
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }
}
