use thiserror::Error;

///
pub type Result<T> = std::result::Result<T, Error>;

/// Generic telemux Error
///
/// Caller-contract failures carry a message describing the violated
/// argument; transport failures carry the underlying I/O error. The
/// negotiation variants are signals rather than hard failures:
/// [`Error::FormatChanged`] asks the caller to reinstall its template and
/// continue.
#[derive(Debug, Error)]
pub enum Error {
    /// A field name is empty or does not match `[A-Za-z][A-Za-z0-9_]*`.
    #[error("invalid field name {0:?}")]
    InvalidName(String),
    /// A field name could not be resolved against the registry.
    #[error("unknown field {0:?}")]
    UnknownField(String),
    /// A field id is not present in the template at hand, or the operation
    /// does not apply to its kind (fixed vs. variable-length).
    #[error("invalid field id {0}")]
    InvalidFieldId(u16),
    /// A field is already registered, or accessed, with a different type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A spec string or a textual field value could not be parsed.
    #[error("malformed spec: {0}")]
    SpecSyntax(String),
    /// A record or a variable-field payload does not fit its buffer.
    #[error("record overflow: {0}")]
    RecordOverflow(String),
    /// Registry or container-pool capacity exhausted.
    #[error("resource exhausted: {0}")]
    Resource(String),
    /// Socket or file I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The peer offers a format this endpoint cannot accept.
    #[error("format mismatch")]
    FormatMismatch,
    /// The peer's format changed. The new spec string is carried so that the
    /// caller can expand and reinstall its template.
    #[error("format changed to {0:?}")]
    FormatChanged(String),
    /// The peer has not declared any stream format.
    #[error("format unknown")]
    FormatUnknown,
    /// A bounded wait expired without data or space.
    #[error("timeout")]
    Timeout,
    /// The endpoint was terminated while the call was in flight.
    #[error("terminated")]
    Terminated,
}

impl Error {
    /// Return a new malformed-spec error with a message
    pub fn spec<E: Into<String>>(msg: E) -> Self {
        let msg = msg.into();
        log::error!("{}", msg);
        Error::SpecSyntax(msg)
    }

    /// Return a new overflow error with a message
    pub fn overflow<E: Into<String>>(msg: E) -> Self {
        let msg = msg.into();
        log::error!("{}", msg);
        Error::RecordOverflow(msg)
    }

    /// Return a new resource-exhaustion error with a message
    pub fn resource<E: Into<String>>(msg: E) -> Self {
        let msg = msg.into();
        log::error!("{}", msg);
        Error::Resource(msg)
    }
}
