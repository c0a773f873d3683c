//! Application orchestration for requesting crop-health predictions.

use crate::client::{CropHealthClient, PredictionService};
use crate::models::{
    BodyFraming, Config, ImagePayload, ModelName, Prediction, PredictionReport, HEALTHY_LABEL,
};
use crate::{Error, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reads an image and fans it out to the prediction models.
pub struct App {
    service: Box<dyn PredictionService>,
    base_url: String,
    framing: BodyFraming,
}

impl App {
    /// Build an app around any prediction service.
    ///
    /// Integration tests and local harnesses use this to inject
    /// [`MockPredictionClient`](crate::client::MockPredictionClient).
    pub fn with_service(service: Box<dyn PredictionService>, config: &Config) -> Self {
        Self {
            service,
            base_url: config.api_url.clone(),
            framing: config.framing,
        }
    }

    /// Construct an app talking to the HTTP API described by `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let client = CropHealthClient::new(config)?;
        info!(
            "Prediction API: {} (framing: {})",
            client.base_url(),
            client.framing()
        );
        Ok(Self::with_service(Box::new(client), config))
    }

    pub async fn ping(&self) -> Result<bool> {
        self.service.ping().await
    }

    /// Send the image at `image_path` to each requested model.
    ///
    /// An empty `models` slice means all three. Predictions come back in
    /// `ModelName::ALL` order whatever order they were asked for in.
    pub async fn run_predictions(
        &self,
        image_path: &Path,
        models: &[ModelName],
    ) -> Result<PredictionReport> {
        let image = ImagePayload::load(image_path).await?;
        info!(
            "Requesting predictions for {} ({} bytes)",
            image.file_name,
            image.len()
        );

        let wanted = |model: ModelName| models.is_empty() || models.contains(&model);

        let (binary, single_hlt, multi_hlt) = tokio::join!(
            self.predict_if(wanted(ModelName::Binary), ModelName::Binary, &image),
            self.predict_if(wanted(ModelName::SingleHlt), ModelName::SingleHlt, &image),
            self.predict_if(wanted(ModelName::MultiHlt), ModelName::MultiHlt, &image)
        );

        let predictions: Vec<Prediction> = [binary?, single_hlt?, multi_hlt?]
            .into_iter()
            .flatten()
            .collect();

        Ok(PredictionReport {
            image: image.file_name,
            image_bytes: image.bytes.len(),
            framing: self.framing,
            base_url: self.base_url.clone(),
            created_at: Utc::now(),
            predictions,
        })
    }

    async fn predict_if(
        &self,
        wanted: bool,
        model: ModelName,
        image: &ImagePayload,
    ) -> Result<Option<Prediction>> {
        if !wanted {
            return Ok(None);
        }

        match self.service.predict(model, image).await {
            Ok(prediction) => {
                info!(
                    "[{}] {} classes, healthy confidence: {}",
                    model,
                    prediction.classes.len(),
                    prediction
                        .healthy_confidence()
                        .map(|c| format!("{:.4}", c))
                        .unwrap_or_else(|| "n/a".to_string())
                );
                debug!("[{}] top classes: {:?}", model, prediction.top(5));

                // binary returns both of its classes, so they should cover 1.0
                let total = prediction.total_confidence();
                if model == ModelName::Binary && (total - 1.0).abs() > 0.01 {
                    warn!("[{}] Confidences sum to {:.4}, expected 1.0", model, total);
                }

                Ok(Some(prediction))
            }
            Err(e) => {
                error!("[{}] Prediction failed: {}", model, e);
                Err(e)
            }
        }
    }

    /// Render a report for the terminal.
    ///
    /// `binary` prints its healthy-class confidence; the multiclass models
    /// print their whole response object.
    pub fn render(report: &PredictionReport) -> Result<String> {
        let mut lines = Vec::with_capacity(report.predictions.len());

        for prediction in &report.predictions {
            let line = match prediction.model {
                ModelName::Binary => match prediction.classes.get(HEALTHY_LABEL) {
                    Some(value) => format!("[{}] HLT: {}", prediction.model, value),
                    None => {
                        warn!("[{}] Response has no HLT field", prediction.model);
                        format!("[{}] HLT: missing", prediction.model)
                    }
                },
                ModelName::SingleHlt | ModelName::MultiHlt => format!(
                    "[{}] {}",
                    prediction.model,
                    serde_json::to_string(&prediction.classes)?
                ),
            };
            lines.push(line);
        }

        Ok(lines.join("\n"))
    }

    /// Write the report as pretty JSON under `dir`, returning the file path.
    pub fn save_report(report: &PredictionReport, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;

        let stem = Path::new(&report.image)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "Cannot derive a report name from '{}'",
                    report.image
                ))
            })?;

        let session_id = Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "{}_{}_{}.json",
            stem,
            report.created_at.format("%Y%m%dT%H%M%SZ"),
            &session_id[..8]
        );
        let path = dir.join(file_name);

        fs::write(&path, serde_json::to_string_pretty(report)?)?;
        info!("Saved report at: {}", path.display());
        Ok(path)
    }
}
