//! Data models and structures
//!
//! Defines the prediction endpoints, request payloads, response wrappers
//! and client configuration for the crop-health API.

use crate::mime::detect_image_mime;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Label of the healthy class in every model's output.
pub const HEALTHY_LABEL: &str = "HLT";

/// One of the three classification models served under `/predictions/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelName {
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "single-HLT")]
    SingleHlt,
    #[serde(rename = "multi-HLT")]
    MultiHlt,
}

impl ModelName {
    pub const ALL: [ModelName; 3] = [ModelName::Binary, ModelName::SingleHlt, ModelName::MultiHlt];

    /// Path segment appended to `/predictions/`.
    pub fn path(self) -> &'static str {
        match self {
            ModelName::Binary => "binary",
            ModelName::SingleHlt => "single-HLT",
            ModelName::MultiHlt => "multi-HLT",
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for ModelName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ModelName::ALL
            .into_iter()
            .find(|model| model.path().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                Error::Config(format!(
                    "Unknown model '{}'. Expected one of: binary, single-HLT, multi-HLT",
                    s
                ))
            })
    }
}

/// How the image bytes are placed in the request body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFraming {
    /// The body is the image bytes as-is.
    #[default]
    Raw,
    /// A multipart form with the image in a single `file` field.
    Multipart,
}

impl fmt::Display for BodyFraming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyFraming::Raw => f.write_str("raw"),
            BodyFraming::Multipart => f.write_str("multipart"),
        }
    }
}

impl FromStr for BodyFraming {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "binary" => Ok(BodyFraming::Raw),
            "multipart" | "form" => Ok(BodyFraming::Multipart),
            other => Err(Error::Config(format!(
                "Unknown body framing '{}'. Expected 'raw' or 'multipart'",
                other
            ))),
        }
    }
}

/// An image read from disk, ready to be sent to every model.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: &'static str,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, file_name: String) -> Self {
        let mime_type = detect_image_mime(&bytes);
        Self {
            bytes,
            file_name,
            mime_type,
        }
    }

    /// Read the whole file. Nothing is sent until this completes.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            tracing::error!("Failed to read image {}: {}", path.display(), e);
            e
        })?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("image")
            .to_string();

        let payload = Self::new(bytes, file_name);
        tracing::debug!(
            "Loaded {} ({} bytes, {})",
            path.display(),
            payload.len(),
            payload.mime_type
        );

        Ok(payload)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Class confidences returned by one model, kept exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model: ModelName,
    pub classes: Map<String, Value>,
}

impl Prediction {
    /// Parse a response body. Anything other than a JSON object is rejected.
    pub fn from_body(model: ModelName, body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)?;
        Self::from_value(model, value)
    }

    pub fn from_value(model: ModelName, value: Value) -> Result<Self> {
        match value {
            Value::Object(classes) => Ok(Self { model, classes }),
            other => Err(Error::InvalidResponse(format!(
                "{} returned a non-object JSON body: {}",
                model, other
            ))),
        }
    }

    pub fn confidence(&self, label: &str) -> Option<f64> {
        self.classes.get(label).and_then(Value::as_f64)
    }

    /// Confidence that the crop is healthy.
    ///
    /// The multi-HLT model has one healthy class per crop (`HLT_maize`,
    /// `HLT_cocoa`, ...), so their confidences are summed.
    pub fn healthy_confidence(&self) -> Option<f64> {
        match self.model {
            ModelName::Binary | ModelName::SingleHlt => self.confidence(HEALTHY_LABEL),
            ModelName::MultiHlt => {
                let healthy: Vec<f64> = self
                    .classes
                    .iter()
                    .filter(|(label, _)| is_healthy_label(label))
                    .filter_map(|(_, value)| value.as_f64())
                    .collect();

                if healthy.is_empty() {
                    None
                } else {
                    Some(healthy.iter().sum())
                }
            }
        }
    }

    /// Numeric classes by descending confidence. Ties keep response order.
    pub fn top(&self, k: usize) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .classes
            .iter()
            .filter_map(|(label, value)| value.as_f64().map(|c| (label.clone(), c)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(k);
        ranked
    }

    pub fn total_confidence(&self) -> f64 {
        self.classes.values().filter_map(Value::as_f64).sum()
    }
}

fn is_healthy_label(label: &str) -> bool {
    label == HEALTHY_LABEL
        || label
            .strip_prefix(HEALTHY_LABEL)
            .is_some_and(|rest| rest.starts_with('_'))
}

/// Everything one run produced, in a form that can be saved as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionReport {
    pub image: String,
    pub image_bytes: usize,
    pub framing: BodyFraming,
    pub base_url: String,
    pub created_at: DateTime<Utc>,
    pub predictions: Vec<Prediction>,
}

impl PredictionReport {
    pub fn get(&self, model: ModelName) -> Option<&Prediction> {
        self.predictions.iter().find(|p| p.model == model)
    }
}

/// Body of `GET /ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy") || self.status.eq_ignore_ascii_case("ok")
    }
}

// Configuration
pub const DEFAULT_API_URL: &str = "http://localhost:5000";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_url: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub framing: BodyFraming,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            framing: BodyFraming::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(e.into());
            }
        }

        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys take their defaults.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_url = lookup("CROP_HEALTH_API_URL")
            .map(|url| normalize_base_url(&url))
            .unwrap_or(defaults.api_url);

        let timeout = match lookup("CROP_HEALTH_TIMEOUT_SECS") {
            Some(raw) => match parse_number("CROP_HEALTH_TIMEOUT_SECS", &raw)? {
                0 => {
                    return Err(Error::Config(
                        "CROP_HEALTH_TIMEOUT_SECS must be at least 1".to_string(),
                    ))
                }
                secs => Duration::from_secs(secs),
            },
            None => defaults.timeout,
        };

        let max_retries = match lookup("CROP_HEALTH_MAX_RETRIES") {
            Some(raw) => parse_number("CROP_HEALTH_MAX_RETRIES", &raw)?,
            None => defaults.max_retries,
        };

        let retry_delay = match lookup("CROP_HEALTH_RETRY_DELAY_MS") {
            Some(raw) => Duration::from_millis(parse_number("CROP_HEALTH_RETRY_DELAY_MS", &raw)?),
            None => defaults.retry_delay,
        };

        let framing = match lookup("CROP_HEALTH_FRAMING") {
            Some(raw) => raw.parse()?,
            None => defaults.framing,
        };

        let config = Self {
            api_url,
            timeout,
            max_retries,
            retry_delay,
            framing,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no request could ever succeed with.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_url).map_err(|e| {
            Error::Config(format!("Invalid API URL '{}': {}", self.api_url, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
            return Err(Error::Config(format!(
                "API URL '{}' must be an absolute http(s) URL",
                self.api_url
            )));
        }

        if self.timeout.is_zero() {
            return Err(Error::Config("Request timeout must be non-zero".to_string()));
        }

        Ok(())
    }

    pub fn with_api_url(mut self, api_url: &str) -> Self {
        self.api_url = normalize_base_url(api_url);
        self
    }

    pub fn with_framing(mut self, framing: BodyFraming) -> Self {
        self.framing = framing;
        self
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::Config(format!(
            "{} must be a non-negative integer, got '{}'",
            key, raw
        ))
    })
}
