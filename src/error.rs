//! Session-level errors. Anything in here aborts the current session without
//! committing; per-subscription failures use [`crate::fetcher::FetchError`]
//! and are recorded on the subscription instead.

use thiserror::Error;

use crate::packer::PackError;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Another writer holds `.locked`.
    #[error("catalogue is locked by another writer (use --force to override)")]
    Locked,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// `db.json` could not be understood.
    #[error("unable to parse catalogue: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// An administrative request that fails validation.
    #[error("{0}")]
    Invalid(String),

    #[error("{kind} id \"{id}\" not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("session is read-only")]
    ReadOnly,

    #[error("unable to pack articles: {0}")]
    Pack(#[from] PackError),

    #[error("fetch worker failed: {0}")]
    Worker(String),
}
