use std::fmt;
use tokio_postgres::Error as PgError;

#[derive(Debug)]
pub enum Error {
    Database(PgError),
    /// A u64 column value does not fit the signed SQL integer type.
    OutOfRange(u64),
    InvalidJson(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<PgError> for Error {
    fn from(e: PgError) -> Self {
        Error::Database(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidJson(e)
    }
}
