//! Turns prediction payloads into fixed-shape embedding vectors.
//!
//! Two extraction variants exist, selected by model version. The single-stage
//! model answers with one 1376-element vector. The two-stage model is chained:
//! the first stage returns a (1, 8, 8, 1376) spatial embedding which is fed
//! back to the second stage as a numeric array, yielding the final (32, 768)
//! embedding. All shape checks are hard contract failures, never retried,
//! since a mismatch indicates an incompatible deployment rather than a
//! transient condition.

use std::fmt;
use std::str::FromStr;

use log::debug;
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};
use serde_json::Value;

use crate::example::ImageExample;
use crate::prediction::{EndpointDescriptor, PredictInstance, PredictTransport, PredictionError};

/// Embedding length of the single-stage model response.
pub const V1_EMBEDDING_LEN: usize = 1376;
/// Expected shape of the two-stage model's first-stage response.
pub const V2_INTERMEDIATE_SHAPE: [usize; 4] = [1, 8, 8, 1376];
/// Expected shape of the two-stage model's final response.
pub const V2_FINAL_SHAPE: [usize; 2] = [32, 768];

const V2_RESPONSE_KEY: &str = "img_emb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersion {
    /// Single-stage foundation model.
    V1,
    /// Two-stage chained model.
    V2,
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVersion::V1 => write!(f, "v1"),
            ModelVersion::V2 => write!(f, "v2"),
        }
    }
}

impl FromStr for ModelVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(ModelVersion::V1),
            "v2" => Ok(ModelVersion::V2),
            other => Err(format!("Unknown model version: {other:?}")),
        }
    }
}

/// Endpoint table for every deployed model stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub v1: EndpointDescriptor,
    pub v2_stage_c: EndpointDescriptor,
    pub v2_stage_b: EndpointDescriptor,
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractionError {
    #[error("Expected exactly {expected} prediction instance(s) in response but got {actual}")]
    InstanceCount { expected: usize, actual: usize },
    #[error("Prediction response is missing expected field {field:?}")]
    MissingField { field: &'static str },
    #[error("Prediction response shape {actual:?} does not match expected shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Prediction response is not a well-formed numeric array")]
    MalformedArray,
    #[error("Error calling prediction endpoint for stage: {stage}")]
    Prediction {
        stage: &'static str,
        #[source]
        source: PredictionError,
    },
}

/// Runs the extraction variant selected by `version` and returns the
/// embedding with its model-specific shape.
pub async fn generate_embedding<T: PredictTransport>(
    transport: &T,
    endpoints: &EndpointConfig,
    version: ModelVersion,
    example: &ImageExample,
) -> Result<ArrayD<f32>, ExtractionError> {
    match version {
        ModelVersion::V1 => embedding_v1(transport, &endpoints.v1, example)
            .await
            .map(|a| a.into_dyn()),
        ModelVersion::V2 => {
            embedding_v2(transport, &endpoints.v2_stage_c, &endpoints.v2_stage_b, example)
                .await
                .map(|a| a.into_dyn())
        }
    }
}

/// Single-stage extraction: one request, one instance, one inner list,
/// reshaped to a 1-D vector of length 1376.
pub async fn embedding_v1<T: PredictTransport>(
    transport: &T,
    endpoint: &EndpointDescriptor,
    example: &ImageExample,
) -> Result<Array1<f32>, ExtractionError> {
    let predictions = transport
        .predict(endpoint, &[PredictInstance::from_example(example)])
        .await
        .map_err(|e| ExtractionError::Prediction {
            stage: "v1",
            source: e,
        })?;
    if predictions.len() != 1 {
        return Err(ExtractionError::InstanceCount {
            expected: 1,
            actual: predictions.len(),
        });
    }

    let array = json_to_array(&predictions[0])?;
    let expected = [1, V1_EMBEDDING_LEN];
    if array.shape() != expected {
        return Err(ExtractionError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: array.shape().to_vec(),
        });
    }
    debug!("Extracted v1 embedding of length {V1_EMBEDDING_LEN}");
    Ok(Array1::from_iter(array))
}

/// Two-stage extraction: the first stage's spatial embedding is fed to the
/// second stage as a numeric array instance.
pub async fn embedding_v2<T: PredictTransport>(
    transport: &T,
    stage_c: &EndpointDescriptor,
    stage_b: &EndpointDescriptor,
    example: &ImageExample,
) -> Result<Array2<f32>, ExtractionError> {
    let stage_c_response = transport
        .predict(stage_c, &[PredictInstance::from_example(example)])
        .await
        .map_err(|e| ExtractionError::Prediction {
            stage: "v2 stage c",
            source: e,
        })?;
    let first = stage_c_response
        .first()
        .ok_or(ExtractionError::InstanceCount {
            expected: 1,
            actual: 0,
        })?;

    // The service answers with the (8, 8, 1376) spatial grid of one study;
    // the batch axis is reinstated before the chained call.
    let intermediate = json_to_array(first)?.insert_axis(Axis(0));
    if intermediate.shape() != V2_INTERMEDIATE_SHAPE {
        return Err(ExtractionError::ShapeMismatch {
            expected: V2_INTERMEDIATE_SHAPE.to_vec(),
            actual: intermediate.shape().to_vec(),
        });
    }
    debug!("Stage-c embedding has expected shape {V2_INTERMEDIATE_SHAPE:?}");

    let stage_b_response = transport
        .predict(stage_b, &[PredictInstance::from_array(intermediate.view())])
        .await
        .map_err(|e| ExtractionError::Prediction {
            stage: "v2 stage b",
            source: e,
        })?;
    if stage_b_response.len() != 1 {
        return Err(ExtractionError::InstanceCount {
            expected: 1,
            actual: stage_b_response.len(),
        });
    }
    let embedding_value = stage_b_response[0]
        .get(V2_RESPONSE_KEY)
        .ok_or(ExtractionError::MissingField {
            field: V2_RESPONSE_KEY,
        })?;

    let embedding = json_to_array(embedding_value)?;
    if embedding.shape() != V2_FINAL_SHAPE {
        return Err(ExtractionError::ShapeMismatch {
            expected: V2_FINAL_SHAPE.to_vec(),
            actual: embedding.shape().to_vec(),
        });
    }
    debug!("Extracted v2 embedding of shape {V2_FINAL_SHAPE:?}");

    let flat: Vec<f32> = embedding.into_iter().collect();
    Array2::from_shape_vec((V2_FINAL_SHAPE[0], V2_FINAL_SHAPE[1]), flat)
        .map_err(|_| ExtractionError::MalformedArray)
}

// private functions and variables

/// Parses a nested JSON list of numbers into an n-dimensional array. The
/// shape is taken from the leading elements of each nesting level; every
/// sibling list is then required to match it, so ragged or non-numeric
/// payloads fail regardless of their total element count.
fn json_to_array(value: &Value) -> Result<ArrayD<f32>, ExtractionError> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }

    let mut flat = Vec::with_capacity(shape.iter().product());
    collect_numbers(value, &shape, &mut flat)?;

    ArrayD::from_shape_vec(IxDyn(&shape), flat).map_err(|_| ExtractionError::MalformedArray)
}

fn collect_numbers(
    value: &Value,
    shape: &[usize],
    out: &mut Vec<f32>,
) -> Result<(), ExtractionError> {
    match (value, shape) {
        (Value::Array(items), [expected_len, inner_shape @ ..]) => {
            if items.len() != *expected_len {
                return Err(ExtractionError::MalformedArray);
            }
            for item in items {
                collect_numbers(item, inner_shape, out)?;
            }
            Ok(())
        }
        (Value::Number(number), []) => {
            let v = number.as_f64().ok_or(ExtractionError::MalformedArray)?;
            out.push(v as f32);
            Ok(())
        }
        _ => Err(ExtractionError::MalformedArray),
    }
}
