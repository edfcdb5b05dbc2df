pub mod client;
pub mod error;
pub mod types;

pub use client::{PredictionApi, ReplicateClient};
pub use error::ApiError;
pub use types::CreatePrediction;
