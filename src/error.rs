use std::path::PathBuf;

use thiserror::Error;

/// Broad classification of every failure the reader can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The file is not something this crate can read.
    Format,
    /// A layout table or dependency registration is wrong.
    Configuration,
    /// Seeking or reading the underlying stream failed.
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("not a valid archive file")]
    NotAValidArchive,

    #[error("unrecognized build string {0:?}")]
    UnknownBuild(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("scenario tag could not be resolved unambiguously")]
    AmbiguousScenario,

    #[error("more than one {0} tag in the index")]
    DuplicateSystemTag(&'static str),

    #[error("invalid {what} value: {value}")]
    InvalidValue { what: &'static str, value: i64 },

    #[error("no layout of {type_name} applies to version {version:?}")]
    NoLayout {
        type_name: &'static str,
        version: Option<i32>,
    },

    #[error("more than one layout of {type_name} applies to version {version:?}")]
    AmbiguousLayout {
        type_name: &'static str,
        version: Option<i32>,
    },

    #[error("layouts of {type_name} have overlapping version ranges {first} and {second}")]
    OverlappingLayout {
        type_name: &'static str,
        first: String,
        second: String,
    },

    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    #[error("layout of {0} has no fixed size")]
    MissingSize(&'static str),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FileNotFound(_)
            | Error::NotAValidArchive
            | Error::UnknownBuild(_)
            | Error::UnsupportedFormat(_)
            | Error::AmbiguousScenario
            | Error::DuplicateSystemTag(_)
            | Error::InvalidValue { .. } => ErrorKind::Format,
            Error::NoLayout { .. }
            | Error::AmbiguousLayout { .. }
            | Error::OverlappingLayout { .. }
            | Error::MissingDependency(_)
            | Error::MissingSize(_) => ErrorKind::Configuration,
        }
    }
}

/// Classify an error chain by the first recognized cause.
pub fn kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<Error>() {
            Some(e.kind())
        } else if cause.downcast_ref::<std::io::Error>().is_some() {
            Some(ErrorKind::Io)
        } else {
            None
        }
    })
}

/// Returns the typed [`Error`] at any depth of the chain.
pub fn find(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_kind_through_context() {
        let err: anyhow::Result<()> = Err(Error::AmbiguousScenario.into());
        let err = err.context("opening map").unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::Format));
        assert!(matches!(find(&err), Some(Error::AmbiguousScenario)));

        let io = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let err = anyhow::Error::from(io).context("reading header");
        assert_eq!(kind(&err), Some(ErrorKind::Io));

        assert_eq!(kind(&anyhow::anyhow!("plain")), None);
    }
}
