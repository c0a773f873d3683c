use super::PredictionService;
use crate::models::{ImagePayload, ModelName, Prediction};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A recorded `predict` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub model: ModelName,
    pub bytes: Vec<u8>,
    pub file_name: String,
}

#[derive(Clone)]
pub struct MockPredictionClient {
    responses: Arc<Mutex<HashMap<ModelName, Value>>>,
    failures: Arc<Mutex<HashMap<ModelName, String>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    healthy: bool,
}

impl MockPredictionClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            healthy: true,
        }
    }

    pub fn with_response(self, model: ModelName, response: Value) -> Self {
        self.responses.lock().unwrap().insert(model, response);
        self
    }

    pub fn with_failure(self, model: ModelName, message: String) -> Self {
        self.failures.lock().unwrap().insert(model, message);
        self
    }

    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn get_call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn get_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockPredictionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PredictionService for MockPredictionClient {
    async fn predict(&self, model: ModelName, image: &ImagePayload) -> Result<Prediction> {
        self.calls.lock().unwrap().push(RecordedCall {
            model,
            bytes: image.bytes.clone(),
            file_name: image.file_name.clone(),
        });

        if let Some(message) = self.failures.lock().unwrap().get(&model) {
            return Err(Error::Api(message.clone()));
        }

        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&model)
            .cloned()
            // Even split between the healthy class and everything else
            .unwrap_or_else(|| serde_json::json!({"HLT": 0.5, "NOT_HLT": 0.5}));

        Prediction::from_value(model, response)
    }

    async fn ping(&self) -> Result<bool> {
        Ok(self.healthy)
    }
}
