use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Short error code string used in health and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
