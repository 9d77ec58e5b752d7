use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type raised by all fallible operations of this crate.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
pub(crate) enum ErrorInner {
    Limit(&'static str),
    Internal(&'static str),
    UnknownCompressor(String),
    InvalidOption(String),
    Compress(std::io::Error),

    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Limit(msg) => write!(f, "{msg}"),
            ErrorInner::Internal(msg) => write!(f, "internal error: {msg}"),
            ErrorInner::UnknownCompressor(name) => {
                write!(f, "unsupported compressor '{name}'")
            }
            ErrorInner::InvalidOption(msg) => {
                write!(f, "invalid compressor option: {msg}")
            }
            ErrorInner::Compress(err) => write!(f, "compressor failed: {err}"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Compress(err) | ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}
