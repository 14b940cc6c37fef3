use std::fmt::Display;

/// Cinder errors.
#[derive(Debug)]
pub enum Error {
    /// An I/O failure reading or writing a data, index, bloom, or meta file.
    /// Write paths leave engine state unchanged: an SSTable is only published
    /// after all of its files are durable.
    Io(std::io::Error),
    /// Invalid on-disk data: a length prefix decoded to a negative or absurd
    /// value, a truncated entry, or an undecodable sidecar file. The affected
    /// SSTable is never published.
    Corruption(String),
    /// A flush was attempted while a compaction holds the write gate.
    /// Recoverable; the flush loop retries on its next tick.
    InProgress,
    /// Invalid configuration, fatal at open.
    Config(String),
    /// Invalid caller input, typically an empty key.
    InvalidInput(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InProgress => write!(f, "compaction in progress"),
            Error::Config(msg) => write!(f, "invalid config: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corruption(err.to_string())
    }
}

/// Constructs an Error::Corruption from a format string.
#[macro_export]
macro_rules! corrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// A cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
