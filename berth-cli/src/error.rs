//! CLI-specific error types with exit codes.

use std::fmt;

use berth::Error as LibError;

/// CLI-specific error type with exit code mapping.
#[derive(Debug)]
pub enum CliError {
    /// Library error (wrapped).
    Library(LibError),

    /// Invalid command-line arguments.
    InvalidArguments(String),

    /// I/O error.
    Io(std::io::Error),

    /// The daemon could not be reached.
    DaemonUnavailable {
        /// The URL that was tried.
        url: String,
    },

    /// The daemon rejected the request.
    Api {
        /// The wire error code.
        code: String,
        /// The daemon's message.
        message: String,
    },

    /// Configuration error.
    Config(String),

    /// Semantic failure (e.g. a check that did not hold).
    SemanticFailure(String),
}

impl CliError {
    /// Exit code for this error.
    ///
    /// - 1: semantic failure or daemon-rejected request
    /// - 2: daemon unreachable
    /// - 4: invalid arguments
    /// - 5: I/O error
    /// - 6: other library error
    /// - 7: configuration error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::SemanticFailure(_) | CliError::Api { .. } => 1,
            CliError::DaemonUnavailable { .. } => 2,
            CliError::InvalidArguments(_) => 4,
            CliError::Io(_) => 5,
            CliError::Library(lib) => match lib {
                LibError::Validation { .. } => 7,
                _ => 6,
            },
            CliError::Config(_) => 7,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Library(e) => write!(f, "{e}"),
            CliError::InvalidArguments(msg) => write!(f, "invalid arguments: {msg}"),
            CliError::Io(e) => write!(f, "I/O error: {e}"),
            CliError::DaemonUnavailable { url } => {
                write!(
                    f,
                    "daemon unreachable at {url} (start it with `berth daemon start`)"
                )
            }
            CliError::Api { code, message } => write!(f, "{message} [{code}]"),
            CliError::Config(msg) => write!(f, "configuration error: {msg}"),
            CliError::SemanticFailure(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<LibError> for CliError {
    fn from(err: LibError) -> Self {
        CliError::Library(err)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io(err)
    }
}
