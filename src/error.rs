use std::path::PathBuf;

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// No eligible or recoverable rows. Expected in steady state; drives the
    /// idle wait rather than being reported as a failure.
    #[snafu(display("Queue is empty"))]
    EmptyQueue,

    #[snafu(display("Illegal queue state: {message}"))]
    IllegalState { message: String },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Error reading configuration from environment"))]
    Config {
        #[snafu(source)]
        source: envy::Error,
    },

    #[snafu(display("Error serializing message"))]
    Serde {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Filesystem error at {}", path.display()))]
    Io {
        #[snafu(source)]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<envy::Error> for Error {
    fn from(source: envy::Error) -> Self {
        Self::Config { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serde { source }
    }
}

impl Error {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }
}
