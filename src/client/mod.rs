//! Crop-health prediction API integration
//!
//! Sends an image to the `/predictions/{model}` endpoints and returns the
//! class confidences each model reports.

pub mod http;
pub mod mock;

pub use http::CropHealthClient;
pub use mock::MockPredictionClient;

use crate::models::{ImagePayload, ModelName, Prediction};
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait PredictionService: Send + Sync {
    async fn predict(&self, model: ModelName, image: &ImagePayload) -> Result<Prediction>;
    async fn ping(&self) -> Result<bool>;
}
