pub mod camera;
pub mod geometry;
pub mod robust_loss;

pub use camera::*;
pub use geometry::*;
pub use robust_loss::RobustLoss;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
