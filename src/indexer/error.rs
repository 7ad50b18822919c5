use crate::beacon_client::Error as ApiError;
use crate::database::Error as DbError;
use crate::types::Epoch;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    Api(ApiError),
    Database(DbError),
    /// Start was requested while the ingestion loop is already running.
    AlreadyRunning,
    /// No stats cached for an epoch that should be processed.
    NoEpochStats(Epoch),
    /// No canonical block found inside an epoch, so no target root can be
    /// derived yet.
    NoCanonicalBlock(Epoch),
    /// Persistence requested without a configured database.
    DatabaseNotConfigured,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ApiError> for Error {
    fn from(e: ApiError) -> Self {
        Error::Api(e)
    }
}

impl From<DbError> for Error {
    fn from(e: DbError) -> Self {
        Error::Database(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Database(DbError::InvalidJson(e))
    }
}
