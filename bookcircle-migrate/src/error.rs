use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrateError>;

#[derive(Debug, Error)]
pub enum MigrateError {
    /// The operator pasted something that is not a Postgres URI.
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Io(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("migration failed: {0}")]
    Execution(String),
}

impl MigrateError {
    /// Input mistakes exit 2 so scripts can tell them apart from
    /// connection and file failures, which exit 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::Io(_) | Self::Connection(_) | Self::Execution(_) => 1,
        }
    }
}
