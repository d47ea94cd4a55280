use tokio::{io, task::JoinError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bind listener error: {0}")]
    Bind(#[source] io::Error),
    #[error("Listener error: {0}")]
    Listener(#[source] io::Error),
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Server task error: {0}")]
    Join(#[from] JoinError),
}
