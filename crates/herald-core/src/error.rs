use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid channel definition: {0}")]
    InvalidChannel(String),
}

pub type Result<T> = std::result::Result<T, HeraldError>;
