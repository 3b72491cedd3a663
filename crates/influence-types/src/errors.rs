use thiserror::Error;

/// Errors raised by corporateer aggregate bookkeeping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemberLedgerError {
    #[error("insufficient influence: required {required}, available {available}")]
    InsufficientInfluence { required: u64, available: u64 },

    #[error("no tributes left to spend")]
    NoTributesLeft,

    #[error("influence counter overflow")]
    Overflow,
}
