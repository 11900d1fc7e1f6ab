use thiserror::Error;

pub type VdriveResult<T> = Result<T, VdriveError>;

#[derive(Debug, Error)]
pub enum VdriveError {
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("protocol error: {0}")]
    Proto(String),

    #[error("invalid session")]
    InvalidSession,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("update error: {0}")]
    Ota(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
