use super::PredictionService;
use crate::models::{BodyFraming, Config, HealthResponse, ImagePayload, ModelName, Prediction};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{debug, error, warn};

/// Form field the service reads the upload from.
const FILE_FIELD: &str = "file";

pub struct CropHealthClient {
    client: Client,
    base_url: String,
    framing: BodyFraming,
    max_retries: usize,
    retry_delay: Duration,
}

impl CropHealthClient {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self::new_with_client(config, client))
    }

    pub fn new_with_client(config: &Config, client: Client) -> Self {
        Self {
            client,
            base_url: config.api_url.clone(),
            framing: config.framing,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    fn endpoint(&self, model: ModelName) -> String {
        format!("{}/predictions/{}", self.base_url, model.path())
    }

    // Rebuilt for every attempt: a multipart form is consumed when sent.
    fn build_request(&self, url: &str, image: &ImagePayload) -> Result<RequestBuilder> {
        let request = self.client.post(url);

        match self.framing {
            BodyFraming::Raw => Ok(request
                .header(CONTENT_TYPE, image.mime_type)
                .body(image.bytes.clone())),
            BodyFraming::Multipart => {
                let part = Part::bytes(image.bytes.clone())
                    .file_name(image.file_name.clone())
                    .mime_str(image.mime_type)?;
                Ok(request.multipart(Form::new().part(FILE_FIELD, part)))
            }
        }
    }

    async fn send_prediction(&self, model: ModelName, image: &ImagePayload) -> Result<Prediction> {
        let url = self.endpoint(model);
        debug!(
            "Sending {} prediction request ({} bytes, {}) to {}",
            model,
            image.len(),
            self.framing,
            url
        );

        let response = self
            .build_request(&url, image)?
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send request to {}: {}", url, e);
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!(
                "Prediction API error for {} (status {}): {}",
                model, status, error_text
            );

            let message = format!("{} returned status {}: {}", url, status, error_text);
            return Err(match status {
                StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT => Error::ServiceUnavailable(message),
                _ => Error::Api(message),
            });
        }

        let body = response.text().await?;
        Prediction::from_body(model, &body).map_err(|e| {
            error!("Failed to parse {} response: {}\nBody: {}", model, e, body);
            e
        })
    }
}

#[async_trait]
impl PredictionService for CropHealthClient {
    async fn predict(&self, model: ModelName, image: &ImagePayload) -> Result<Prediction> {
        let retry_strategy = FixedInterval::new(self.retry_delay).take(self.max_retries);

        RetryIf::spawn(
            retry_strategy,
            || self.send_prediction(model, image),
            |e: &Error| {
                let retryable = e.is_retryable();
                if retryable {
                    warn!("[{}] Retryable failure: {}", model, e);
                }
                retryable
            },
        )
        .await
    }

    async fn ping(&self) -> Result<bool> {
        let url = format!("{}/ping", self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await?;
                match serde_json::from_str::<HealthResponse>(&body) {
                    Ok(health) => {
                        debug!("Ping status: {}", health.status);
                        Ok(health.is_healthy())
                    }
                    Err(e) => {
                        warn!("Unexpected ping response ({}): {}", e, body);
                        Ok(false)
                    }
                }
            }
            Ok(response) => {
                warn!("Prediction service ping failed: {}", response.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Prediction service ping error: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_bytes, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const JPEG_BYTES: [u8; 8] = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];

    fn make_client(
        server: &MockServer,
        framing: BodyFraming,
        max_retries: usize,
    ) -> CropHealthClient {
        let config = Config {
            max_retries,
            retry_delay: Duration::from_millis(10),
            ..Config::default()
        }
        .with_api_url(&server.uri())
        .with_framing(framing);

        CropHealthClient::new(&config).unwrap()
    }

    fn image() -> ImagePayload {
        ImagePayload::new(JPEG_BYTES.to_vec(), "cocoa.jpg".to_string())
    }

    #[tokio::test]
    async fn test_raw_body_is_the_image_bytes() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/predictions/binary"))
            .and(header("content-type", "image/jpeg"))
            .and(body_bytes(JPEG_BYTES.to_vec()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"HLT": 0.92, "NOT_HLT": 0.08})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 0);
        let prediction = client.predict(ModelName::Binary, &image()).await.unwrap();

        assert_eq!(prediction.model, ModelName::Binary);
        assert_eq!(prediction.healthy_confidence(), Some(0.92));
    }

    #[tokio::test]
    async fn test_multipart_body_uses_file_field() {
        let server = MockServer::start().await;
        let upload = ImagePayload::new(b"leaf scan".to_vec(), "cocoa.jpg".to_string());

        Mock::given(method("POST"))
            .and(path("/predictions/single-HLT"))
            .and(body_string_contains("name=\"file\""))
            .and(body_string_contains("filename=\"cocoa.jpg\""))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"HLT": 0.4, "CSSVD": 0.6})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Multipart, 0);
        let prediction = client
            .predict(ModelName::SingleHlt, &upload)
            .await
            .unwrap();
        assert_eq!(prediction.top(1), vec![("CSSVD".to_string(), 0.6)]);

        let requests = server.received_requests().await.unwrap();
        let content_type = requests[0]
            .headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("multipart/form-data"));

        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("Content-Type: application/octet-stream"));
        assert!(body.contains("leaf scan"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/predictions/multi-HLT"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid image"))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 2);
        let err = client
            .predict(ModelName::MultiHlt, &image())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Api(_)));
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("Invalid image"));
    }

    #[tokio::test]
    async fn test_service_unavailable_is_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/predictions/binary"))
            .respond_with(ResponseTemplate::new(503).set_body_string("worker busy"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/predictions/binary"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"HLT": 0.1, "NOT_HLT": 0.9})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 2);
        let prediction = client.predict(ModelName::Binary, &image()).await.unwrap();
        assert_eq!(prediction.confidence("NOT_HLT"), Some(0.9));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/predictions/binary"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 2);
        let err = client.predict(ModelName::Binary, &image()).await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_non_object_response_is_invalid() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/predictions/binary"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"HLT\""))
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 0);
        let err = client.predict(ModelName::Binary, &image()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_ping_healthy() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "Healthy"})),
            )
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 0);
        assert!(client.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_reports_false_on_unexpected_body() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 0);
        assert!(!client.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_reports_false_without_status_field() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"up": true})))
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 0);
        assert!(!client.ping().await.unwrap());
    }

    #[test]
    fn test_new_rejects_url_without_scheme() {
        let config = Config::default().with_api_url("localhost:5000");
        let err = CropHealthClient::new(&config).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unusable_url_fails_on_first_attempt() {
        let config = Config {
            max_retries: 3,
            retry_delay: Duration::from_millis(300),
            ..Config::default()
        }
        .with_api_url("localhost:5000");
        let client = CropHealthClient::new_with_client(&config, Client::new());

        let started = std::time::Instant::now();
        let err = client.predict(ModelName::Binary, &image()).await.unwrap_err();

        assert!(matches!(err, Error::Http(_)));
        assert!(!err.is_retryable());
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_ping_reports_false_on_error_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = make_client(&server, BodyFraming::Raw, 0);
        assert!(!client.ping().await.unwrap());
    }
}
