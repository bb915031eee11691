//! Test doubles for exercising the generation flow without a live endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::prediction::{EndpointDescriptor, PredictInstance, PredictTransport, PredictionError};

/// A transport that replays a scripted sequence of responses and counts how
/// many times it was called. Once the script is exhausted every further call
/// answers `Unavailable`.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<Vec<Value>, PredictionError>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<Vec<Value>, PredictionError>>) -> Self {
        ScriptedTransport {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of predict calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PredictTransport for ScriptedTransport {
    async fn predict(
        &self,
        _endpoint: &EndpointDescriptor,
        _instances: &[PredictInstance],
    ) -> Result<Vec<Value>, PredictionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .expect("scripted response queue poisoned")
            .pop_front()
            .unwrap_or(Err(PredictionError::Unavailable))
    }
}
