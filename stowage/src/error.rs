//! Error taxonomy shared by the reader and writer engines.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The codec needed random access but the underlying source or sink is
    /// forward-only.
    #[error("source does not support seeking")]
    NotSeekable,

    /// Nothing in the lookahead window matched a known filter or container
    /// signature.
    #[error("no recognized filter or container signature")]
    UnknownFormat,

    /// A compression layer failed to decode. `offset` is the raw-stream
    /// position (pre-decompression bytes) at which the failure surfaced.
    #[error("filter failed at raw byte offset {offset}")]
    Filter {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// A container header failed validation.
    #[error("invalid header field `{field}`")]
    Header { field: &'static str },

    /// The stream ended mid-header or mid-payload.
    #[error("archive truncated")]
    Truncated,

    /// The caller supplied more or fewer payload bytes than the entry
    /// declared.
    #[error("payload size mismatch: declared {declared}, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    /// The operation is not valid in the session's current state. This is a
    /// caller bug, not a data error.
    #[error("invalid operation: {state}")]
    InvalidState { state: &'static str },

    /// The entry or option cannot be represented by the selected format.
    #[error("{what} not supported by this format")]
    Unsupported { what: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn unsupported(what: impl Into<String>) -> Error {
        Error::Unsupported { what: what.into() }
    }
}

/// A copyable snapshot of a fatal condition, kept by a session after it has
/// entered the error state so every later call re-surfaces the same fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    UnknownFormat,
    Filter(u64),
    Header(&'static str),
    Truncated,
    Io(io::ErrorKind),
}

impl Fault {
    /// Faults latch a session; caller-bug and capability errors do not.
    pub(crate) fn of(error: &Error) -> Option<Fault> {
        match error {
            Error::UnknownFormat => Some(Fault::UnknownFormat),
            Error::Filter { offset, .. } => Some(Fault::Filter(*offset)),
            Error::Header { field } => Some(Fault::Header(field)),
            Error::Truncated => Some(Fault::Truncated),
            Error::Io(e) => Some(Fault::Io(e.kind())),
            Error::NotSeekable
            | Error::SizeMismatch { .. }
            | Error::InvalidState { .. }
            | Error::Unsupported { .. } => None,
        }
    }

    pub(crate) fn raise(self) -> Error {
        match self {
            Fault::UnknownFormat => Error::UnknownFormat,
            Fault::Filter(offset) => Error::Filter {
                offset,
                source: io::Error::new(io::ErrorKind::InvalidData, "session failed earlier"),
            },
            Fault::Header(field) => Error::Header { field },
            Fault::Truncated => Error::Truncated,
            Fault::Io(kind) => Error::Io(io::Error::new(kind, "session failed earlier")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_errors_latch() {
        assert!(Fault::of(&Error::Truncated).is_some());
        assert!(Fault::of(&Error::Header { field: "chksum" }).is_some());
        assert!(Fault::of(&Error::InvalidState { state: "no entry open" }).is_none());
        assert!(Fault::of(&Error::NotSeekable).is_none());
    }

    #[test]
    fn fault_reraises_same_condition() {
        let err = Error::Header { field: "size" };
        let fault = Fault::of(&err).unwrap();
        match fault.raise() {
            Error::Header { field } => assert_eq!(field, "size"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
