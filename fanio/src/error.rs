use std::fmt;
use std::io;

/// Errors returned by the fanio runtime.
#[derive(Debug)]
pub enum Error {
    /// Underlying system call failed.
    Io(io::Error),
    /// Configuration value out of range.
    Config(String),
    /// An operation was called in the wrong state (one-shot function called
    /// twice, `event_loop` before `listen`/`bind`, missing handler).
    State(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::State(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
