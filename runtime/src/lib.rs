pub mod orchestrator;

pub use orchestrator::{ResourceGroup, ThreadConfig, THREADS_ENV_VAR};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Invalid thread configuration: {0}")]
    InvalidThreadConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
