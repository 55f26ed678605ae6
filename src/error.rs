//! # Error Types
//!
//! BurrowDB separates two error worlds. The storage layer reports rich,
//! contextual failures through `eyre` (device faults, corrupt pages, encoding
//! errors). The cursor and transaction layers branch on *status kinds*: a
//! merge-cursor move treats "key not found on the btree side" as data, not as
//! a failure, and consolidates such statuses from both sub-cursors.
//!
//! [`Error`] is the typed public surface. Soft statuses (`KeyNotFound`,
//! `CursorIsNil`, `KeyErasedInTxn`, `TxnConflict`, `LimitsReached`) drive
//! control flow inside the cursor layer; everything else aborts the current
//! operation. `LimitsReached` is an internal sentinel — it never escapes to
//! users, who observe `KeyNotFound` instead.
//!
//! Storage-layer `eyre::Report`s convert into [`Error::Io`] at the layer
//! boundary via `From`, so `?` composes across both worlds.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("cursor is nil")]
    CursorIsNil,
    #[error("key erased in transaction")]
    KeyErasedInTxn,
    #[error("conflict with a concurrent transaction")]
    TxnConflict,
    #[error("invalid index")]
    InvIndex,
    #[error("invalid parameter")]
    InvParameter,
    #[error("out of memory")]
    OutOfMemory,
    #[error("limits reached")]
    LimitsReached,
    #[error("i/o error: {0}")]
    Io(eyre::Report),
}

/// Field-less mirror of [`Error`] for comparisons and consolidation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    KeyNotFound,
    DuplicateKey,
    CursorIsNil,
    KeyErasedInTxn,
    TxnConflict,
    InvIndex,
    InvParameter,
    OutOfMemory,
    LimitsReached,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::KeyNotFound => ErrorKind::KeyNotFound,
            Error::DuplicateKey => ErrorKind::DuplicateKey,
            Error::CursorIsNil => ErrorKind::CursorIsNil,
            Error::KeyErasedInTxn => ErrorKind::KeyErasedInTxn,
            Error::TxnConflict => ErrorKind::TxnConflict,
            Error::InvIndex => ErrorKind::InvIndex,
            Error::InvParameter => ErrorKind::InvParameter,
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            Error::LimitsReached => ErrorKind::LimitsReached,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// True for statuses the cursor layer consolidates instead of
    /// propagating.
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Error::KeyNotFound
                | Error::CursorIsNil
                | Error::KeyErasedInTxn
                | Error::TxnConflict
                | Error::LimitsReached
        )
    }
}

impl From<eyre::Report> for Error {
    fn from(report: eyre::Report) -> Self {
        Error::Io(report)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(eyre::Report::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Error::KeyNotFound.kind(), ErrorKind::KeyNotFound);
        assert_eq!(Error::TxnConflict.kind(), ErrorKind::TxnConflict);
        assert_eq!(
            Error::Io(eyre::eyre!("boom")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn soft_statuses_are_distinguished_from_hard_errors() {
        assert!(Error::KeyNotFound.is_status());
        assert!(Error::LimitsReached.is_status());
        assert!(Error::KeyErasedInTxn.is_status());
        assert!(!Error::InvParameter.is_status());
        assert!(!Error::Io(eyre::eyre!("disk gone")).is_status());
    }

    #[test]
    fn eyre_reports_become_io_errors() {
        fn storage_op() -> eyre::Result<()> {
            eyre::bail!("device fault")
        }

        fn cursor_op() -> Result<()> {
            storage_op()?;
            Ok(())
        }

        assert!(matches!(cursor_op(), Err(Error::Io(_))));
    }
}
