use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Ack Error - {0}")]
    Ack(String),

    #[error("Dead Letter Error - {0}")]
    DeadLetter(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
