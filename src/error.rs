#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub(crate) struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Fatal errors unwind the driver loop; everything else is a one-line
    /// diagnostic and the next item is tried.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Jit(_))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { kind }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ErrorKind {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Codegen(String),
    #[error("{0}")]
    Jit(String),
}
