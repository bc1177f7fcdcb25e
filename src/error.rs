use thiserror::Error;

use crate::{deobfuscation::Family, metadata::token::Token};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds
    };
}

macro_rules! decode_error {
    ($msg:expr) => {
        crate::Error::Decode($msg.to_string())
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Decode(format!($fmt, $($arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants follow the failure taxonomy of the deobfuscation pipeline. Some of them are
/// absorbed by the pipeline driver and only show up in per-family reports, others propagate
/// to the caller.
///
/// # Error Categories
///
/// ## Byte level errors
/// - [`Error::InvalidOffset`] - Invalid offset or RVA
/// - [`Error::Malformed`] - Corrupted or invalid structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a buffer
/// - [`Error::NotSupported`] - Unsupported format or feature
/// - [`Error::Empty`] - Empty input provided
///
/// ## Detection errors
/// - [`Error::PartialDetection`] - Anchor type found, required companion member missing
/// - [`Error::TypeNotFound`] - A token did not resolve inside the module arena
/// - [`Error::Rebind`] - A held token could not be re-resolved against a reloaded module
///
/// ## Payload errors
/// - [`Error::PayloadUnavailable`] - No payload source resolved (downgrades the family)
/// - [`Error::Decode`] - A single payload item is corrupt
/// - [`Error::CountMismatch`] - Batched results do not line up with the request
/// - [`Error::Crypto`] - Cipher, key or padding failure
/// - [`Error::Dynamic`] - The out-of-process decryption worker failed
///
/// ## Structural errors
/// - [`Error::Invariant`] - The object model is inconsistent with what a family requires
///
/// # Examples
///
/// ```rust
/// use dotscope_deob::Error;
///
/// fn report(err: &Error) -> &'static str {
///     match err {
///         Error::PayloadUnavailable(_) => "skipped",
///         Error::PartialDetection { .. } | Error::Invariant(_) => "structural",
///         _ => "other",
///     }
/// }
///
/// assert_eq!(report(&Error::PayloadUnavailable("res".into())), "skipped");
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Encountered an invalid offset or RVA.
    ///
    /// This error occurs when an RVA does not map into any section of the image, or an
    /// offset points outside of the structure it is supposed to address.
    #[error("Could not retrieve a valid offset!")]
    InvalidOffset,

    /// The data is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This format or feature is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// A token did not resolve to a definition inside the module arena.
    #[error("Failed to resolve token - {0}")]
    TypeNotFound(Token),

    /// An obfuscator family's anchor type was found, but a member it always carries was not.
    ///
    /// Raised distinctly from a detection miss, since it means an assumption about the
    /// obfuscator's output no longer holds.
    #[error("{family}: {message}")]
    PartialDetection {
        /// The family whose detection stopped half way
        family: Family,
        /// What was missing
        message: String,
    },

    /// No payload source could be resolved for a detected family.
    ///
    /// The pipeline driver turns this into the `DetectedButUndecryptable` state.
    #[error("Payload unavailable - {0}")]
    PayloadUnavailable(String),

    /// A payload item could not be decoded.
    #[error("Decode error - {0}")]
    Decode(String),

    /// The number of decrypted items does not match the number requested.
    #[error("Invalid decrypted array length - expected {expected}, got {actual}")]
    CountMismatch {
        /// Number of items requested
        expected: usize,
        /// Number of items returned
        actual: usize,
    },

    /// A structural invariant of the object model does not hold.
    #[error("Invariant violation - {0}")]
    Invariant(String),

    /// A previously found member could not be re-resolved against a reloaded module.
    #[error("Could not rebind {what} {token}")]
    Rebind {
        /// The stale token
        token: Token,
        /// The kind of member (type, method, field)
        what: &'static str,
    },

    /// A cipher operation failed (bad key size, bad padding, empty input).
    #[error("Crypto error - {0}")]
    Crypto(String),

    /// The out-of-process decryption worker failed or answered with an unexpected value.
    #[error("Dynamic decryption failed - {0}")]
    Dynamic(String),
}

/// `Result` alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_macro_records_location() {
        let err = malformed_error!("bad header {}", 3);
        match err {
            Error::Malformed {
                message,
                file,
                line,
            } => {
                assert_eq!(message, "bad header 3");
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn partial_detection_mentions_family() {
        let err = Error::PartialDetection {
            family: Family::BabelNet,
            message: "Could not find assembly resolver decrypt method".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Babel.NET: Could not find assembly resolver decrypt method"
        );
    }

    #[test]
    fn count_mismatch_display() {
        let err = Error::CountMismatch {
            expected: 3,
            actual: 2,
        };
        assert!(err.to_string().contains("expected 3, got 2"));
    }

    #[test]
    fn decode_macro_formats() {
        let err = decode_error!("odd count {}", 7);
        assert!(matches!(err, Error::Decode(ref m) if m == "odd count 7"));
    }
}
