use headway_engine::adapter::LoadError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Prefetch error: {0}")]
    Prefetch(#[from] headway_engine::PrefetchError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Segment {index} failed: {error}")]
    SegmentLoad { index: u64, error: LoadError },
}
