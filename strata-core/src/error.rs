use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("unsupported codec {0:?}")]
    UnsupportedCodec(String),

    #[error("index signature mismatch")]
    BadMac,

    #[error("index version {0} is obsolete")]
    Obsolete(i64),

    #[error("etag for {path} changed: expected {want}, found {got}")]
    EtagChanged {
        path: String,
        want: String,
        got: String,
    },

    #[error("input does not match the declared row format: {0}")]
    NoMatch(String),

    #[error("record too large: {size} bytes exceeds chunk capacity {max}")]
    TooLarge { size: usize, max: usize },

    #[error("corrupt input: {0}")]
    Corrupt(String),

    #[error("format error: {0}")]
    Format(String),
}

impl Error {
    /// True for errors that retrying cannot fix: bad input bytes, missing
    /// objects, and backing-store mutations. Everything else is transient.
    pub fn is_fatal(&self) -> bool {
        match self {
            // missing objects and corrupt compressed transports
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::InvalidData
                    | std::io::ErrorKind::InvalidInput
            ),
            Error::NoMatch(_)
            | Error::TooLarge { .. }
            | Error::Corrupt(_)
            | Error::EtagChanged { .. }
            | Error::UnsupportedCodec(_)
            | Error::Frame(_)
            | Error::BadMac
            | Error::Obsolete(_) => true,
            Error::Format(_) => false,
        }
    }

    /// Reconstruct an equivalent error, for attaching one copy to an
    /// input entry while propagating the other.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Frame(s) => Error::Frame(s.clone()),
            Error::UnsupportedCodec(s) => Error::UnsupportedCodec(s.clone()),
            Error::BadMac => Error::BadMac,
            Error::Obsolete(v) => Error::Obsolete(*v),
            Error::EtagChanged { path, want, got } => Error::EtagChanged {
                path: path.clone(),
                want: want.clone(),
                got: got.clone(),
            },
            Error::NoMatch(s) => Error::NoMatch(s.clone()),
            Error::TooLarge { size, max } => Error::TooLarge {
                size: *size,
                max: *max,
            },
            Error::Corrupt(s) => Error::Corrupt(s.clone()),
            Error::Format(s) => Error::Format(s.clone()),
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub(crate) fn frame(msg: impl Into<String>) -> Self {
        Error::Frame(msg.into())
    }
}
