use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid size {0:?}: expected \"width,height[,scale]\"")]
    InvalidSize(String),

    #[error("ref contains a newline or carriage return")]
    InvalidRef,

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid value for -{flag}: {reason}")]
    Flag { flag: &'static str, reason: String },
}
