//! Error types shared by the XtFS crates.

use thiserror::Error;

/// Result type alias for common operations.
pub type XtfsResult<T> = Result<T, XtfsError>;

/// Errors raised while building placement and topology values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XtfsError {
    /// An argument violated a construction invariant.
    #[error("Invalid argument: {msg}")]
    InvalidArgument {
        /// Description of the violated invariant.
        msg: String,
    },
}

impl XtfsError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        XtfsError::InvalidArgument { msg: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = XtfsError::invalid_argument("width must be positive");
        assert_eq!(format!("{}", err), "Invalid argument: width must be positive");
    }

    #[test]
    fn test_result_alias() {
        let ok: XtfsResult<u64> = Ok(7);
        assert!(ok.is_ok());

        let err: XtfsResult<u64> = Err(XtfsError::invalid_argument("bad"));
        assert!(matches!(err, Err(XtfsError::InvalidArgument { .. })));
    }
}
