//! Client for remote embedding prediction endpoints.
//!
//! Inputs are encoded into a JSON instance list (a record is base64-encoded
//! whole, a numeric array becomes a nested list) and posted to a deployed
//! model endpoint. Transient service errors are retried with exponential
//! backoff; everything else propagates immediately. The transport is a trait
//! so the retry policy and the callers can be exercised against a scripted
//! in-process endpoint in tests.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, warn};
use ndarray::{ArrayViewD, Axis};
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::example::ImageExample;

const API_DOMAIN: &str = "aiplatform.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RETRIES: usize = 5;

/// Identifies one deployed model endpoint. Immutable configuration; one
/// exists per model stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub project: String,
    pub location: String,
    pub endpoint_id: u64,
}

impl EndpointDescriptor {
    pub fn url(&self) -> String {
        format!(
            "https://{location}-{API_DOMAIN}/v1/projects/{project}/locations/{location}/endpoints/{id}:predict",
            location = self.location,
            project = self.project,
            id = self.endpoint_id,
        )
    }
}

/// One element of the JSON instance list sent to an endpoint.
///
/// The externally-tagged serde representation produces exactly the wire
/// objects the deployed models expect: `{"b64": "..."}` for a serialized
/// record and `{"image_feature": [[...]]}` for a numeric array.
#[derive(Debug, Clone, serde::Serialize)]
pub enum PredictInstance {
    #[serde(rename = "b64")]
    ExampleB64(String),
    #[serde(rename = "image_feature")]
    ImageFeature(Value),
}

impl PredictInstance {
    pub fn from_example(example: &ImageExample) -> Self {
        PredictInstance::ExampleB64(BASE64.encode(example.to_bytes()))
    }

    pub fn from_array(array: ArrayViewD<'_, f32>) -> Self {
        PredictInstance::ImageFeature(nested_list(array))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PredictionError {
    #[error("Prediction endpoint rate limited the request (HTTP 429)")]
    RateLimited,
    #[error("Prediction endpoint reported an internal error (HTTP 500)")]
    Internal,
    #[error("Bad gateway in front of the prediction endpoint (HTTP 502)")]
    BadGateway,
    #[error("Prediction endpoint unavailable (HTTP 503)")]
    Unavailable,
    #[error("Prediction request deadline exceeded")]
    DeadlineExceeded,
    #[error("Prediction endpoint returned unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Error transmitting prediction request")]
    Transport(#[source] anyhow::Error),
    #[error("Prediction response could not be decoded")]
    Decode(#[source] anyhow::Error),
}

impl PredictionError {
    /// Whether the error is one of the transient service error classes that
    /// a retry may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PredictionError::RateLimited
                | PredictionError::Internal
                | PredictionError::BadGateway
                | PredictionError::Unavailable
                | PredictionError::DeadlineExceeded
        )
    }

    fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => PredictionError::RateLimited,
            500 => PredictionError::Internal,
            502 => PredictionError::BadGateway,
            503 => PredictionError::Unavailable,
            504 => PredictionError::DeadlineExceeded,
            status => PredictionError::Status { status, body },
        }
    }
}

/// Seam between the embedding extractor and the remote endpoint.
///
/// Implementations return the raw, un-validated prediction payload; shape
/// interpretation is the caller's concern.
#[async_trait]
pub trait PredictTransport: Send + Sync {
    async fn predict(
        &self,
        endpoint: &EndpointDescriptor,
        instances: &[PredictInstance],
    ) -> Result<Vec<Value>, PredictionError>;
}

#[async_trait]
impl<T: PredictTransport + ?Sized> PredictTransport for std::sync::Arc<T> {
    async fn predict(
        &self,
        endpoint: &EndpointDescriptor,
        instances: &[PredictInstance],
    ) -> Result<Vec<Value>, PredictionError> {
        (**self).predict(endpoint, instances).await
    }
}

/// HTTP transport posting to a hosted prediction endpoint. Performs a single
/// attempt per call; wrap in [`RetryingTransport`] for the retry policy.
pub struct HttpPredictClient {
    http: reqwest::Client,
    access_token: Option<String>,
}

impl HttpPredictClient {
    pub fn new(access_token: Option<String>) -> Result<Self, PredictionError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cxr-embed/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PredictionError::Transport(e.into()))?;
        Ok(HttpPredictClient { http, access_token })
    }
}

#[async_trait]
impl PredictTransport for HttpPredictClient {
    async fn predict(
        &self,
        endpoint: &EndpointDescriptor,
        instances: &[PredictInstance],
    ) -> Result<Vec<Value>, PredictionError> {
        debug!(
            "Posting {} instance(s) to prediction endpoint {}",
            instances.len(),
            endpoint.endpoint_id
        );

        let mut request = self
            .http
            .post(endpoint.url())
            .json(&PredictRequest { instances });
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PredictionError::DeadlineExceeded
            } else {
                PredictionError::Transport(e.into())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PredictionError::from_status(status.as_u16(), body));
        }

        let body: PredictResponse = response
            .json()
            .await
            .map_err(|e| PredictionError::Decode(e.into()))?;
        Ok(body.predictions)
    }
}

/// Retry layer over any transport: retries the transient error classes with
/// jittered exponential backoff up to a bounded number of attempts, and
/// propagates every other error without retrying.
pub struct RetryingTransport<T> {
    inner: T,
    max_retries: usize,
    base_delay: Duration,
}

impl<T> RetryingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self::with_policy(inner, DEFAULT_MAX_RETRIES, RETRY_BASE_DELAY)
    }

    pub fn with_policy(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        RetryingTransport {
            inner,
            max_retries,
            base_delay,
        }
    }
}

#[async_trait]
impl<T: PredictTransport> PredictTransport for RetryingTransport<T> {
    async fn predict(
        &self,
        endpoint: &EndpointDescriptor,
        instances: &[PredictInstance],
    ) -> Result<Vec<Value>, PredictionError> {
        let strategy = ExponentialBackoff::from_millis(self.base_delay.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(
            strategy,
            || self.inner.predict(endpoint, instances),
            |e: &PredictionError| {
                let transient = e.is_transient();
                if transient {
                    warn!("Transient prediction error, will retry: {e}");
                }
                transient
            },
        )
        .await
    }
}

// private functions and variables

#[derive(serde::Serialize)]
struct PredictRequest<'a> {
    instances: &'a [PredictInstance],
}

#[derive(serde::Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Value>,
}

fn nested_list(array: ArrayViewD<'_, f32>) -> Value {
    if array.ndim() == 0 {
        return array
            .first()
            .copied()
            .map(|v| serde_json::json!(v))
            .unwrap_or(Value::Null);
    }
    Value::Array(
        array
            .axis_iter(Axis(0))
            .map(|view| nested_list(view))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn endpoint_url_embeds_project_location_and_id() {
        let endpoint = EndpointDescriptor {
            project: "some-project".to_owned(),
            location: "us-central1".to_owned(),
            endpoint_id: 1234,
        };
        assert_eq!(
            endpoint.url(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/some-project/locations/us-central1/endpoints/1234:predict"
        );
    }

    #[test]
    fn array_instance_serializes_to_nested_lists() {
        let array = array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn();
        let instance = PredictInstance::from_array(array.view());
        let value = serde_json::to_value(&instance).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "image_feature": [[1.0, 2.0], [3.0, 4.0]] })
        );
    }

    #[test]
    fn example_instance_serializes_to_b64_object() {
        let mut example = ImageExample::from_bytes(&[]).unwrap();
        example.put_floats("embedding", vec![1.0]);
        let instance = PredictInstance::from_example(&example);
        let value = serde_json::to_value(&instance).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("b64"));
        assert!(object["b64"].is_string());
    }

    #[test]
    fn only_the_transient_error_classes_are_retryable() {
        assert!(PredictionError::RateLimited.is_transient());
        assert!(PredictionError::Internal.is_transient());
        assert!(PredictionError::BadGateway.is_transient());
        assert!(PredictionError::Unavailable.is_transient());
        assert!(PredictionError::DeadlineExceeded.is_transient());
        assert!(!PredictionError::Status {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!PredictionError::Decode(anyhow::Error::msg("bad json")).is_transient());
    }
}
