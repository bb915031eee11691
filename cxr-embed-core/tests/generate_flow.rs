//! End-to-end tests of the generation flow against a scripted endpoint.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use cxr_embed_core::embeddings::{
    embedding_v1, embedding_v2, generate_embedding, EndpointConfig, ExtractionError, ModelVersion,
    V1_EMBEDDING_LEN, V2_FINAL_SHAPE,
};
use cxr_embed_core::example::{ImageExample, EMBEDDING_KEY, IMAGE_FORMAT_KEY, IMAGE_KEY};
use cxr_embed_core::generate::{EmbeddingGenerator, GenerateOutcome};
use cxr_embed_core::prediction::{
    EndpointDescriptor, PredictTransport, PredictionError, RetryingTransport,
};
use cxr_embed_core::records::{read_tfrecord_example, read_tfrecord_values, OutputFileType};
use cxr_embed_core::testing::ScriptedTransport;
use cxr_embed_core::InputFileType;
use image::{DynamicImage, GrayImage, ImageFormat};
use serde_json::{json, Value};

fn endpoints() -> EndpointConfig {
    let descriptor = |id: u64| EndpointDescriptor {
        project: "test-project".to_owned(),
        location: "us-central1".to_owned(),
        endpoint_id: id,
    };
    EndpointConfig {
        v1: descriptor(1),
        v2_stage_c: descriptor(2),
        v2_stage_b: descriptor(3),
    }
}

fn png_bytes() -> Vec<u8> {
    let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, image::Luma([200u8])));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

fn png_example() -> ImageExample {
    ImageExample::from_png_bytes(&png_bytes()).unwrap()
}

fn v1_response(len: usize) -> Vec<Value> {
    let inner: Vec<f32> = (0..len).map(|i| i as f32 * 0.001).collect();
    vec![json!([inner])]
}

fn v2_stage_c_response(rows: usize) -> Vec<Value> {
    let grid = vec![vec![vec![0.25f32; 1376]; 8]; rows];
    vec![serde_json::to_value(grid).unwrap()]
}

fn v2_stage_b_response() -> Vec<Value> {
    let matrix = vec![vec![0.5f32; V2_FINAL_SHAPE[1]]; V2_FINAL_SHAPE[0]];
    vec![json!({ "img_emb": matrix })]
}

#[tokio::test]
async fn v1_embedding_has_expected_length() {
    let transport = ScriptedTransport::new(vec![Ok(v1_response(V1_EMBEDDING_LEN))]);
    let embedding = embedding_v1(&transport, &endpoints().v1, &png_example())
        .await
        .unwrap();
    assert_eq!(embedding.len(), V1_EMBEDDING_LEN);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn v1_wrong_length_is_a_shape_mismatch() {
    let transport = ScriptedTransport::new(vec![Ok(v1_response(V1_EMBEDDING_LEN - 1))]);
    let err = embedding_v1(&transport, &endpoints().v1, &png_example())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractionError::ShapeMismatch { .. }));
}

#[tokio::test]
async fn v1_extra_instances_are_rejected() {
    let inner: Vec<f32> = vec![0.0; V1_EMBEDDING_LEN];
    let transport =
        ScriptedTransport::new(vec![Ok(vec![json!([inner.clone()]), json!([inner])])]);
    let err = embedding_v1(&transport, &endpoints().v1, &png_example())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::InstanceCount {
            expected: 1,
            actual: 2
        }
    ));
}

#[tokio::test]
async fn v2_chained_extraction_produces_final_shape() {
    let transport = ScriptedTransport::new(vec![
        Ok(v2_stage_c_response(8)),
        Ok(v2_stage_b_response()),
    ]);
    let config = endpoints();
    let embedding = embedding_v2(&transport, &config.v2_stage_c, &config.v2_stage_b, &png_example())
        .await
        .unwrap();
    assert_eq!(embedding.shape(), V2_FINAL_SHAPE);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn v2_intermediate_shape_mismatch_fails_before_stage_b() {
    let transport = ScriptedTransport::new(vec![Ok(v2_stage_c_response(7))]);
    let config = endpoints();
    let err = embedding_v2(&transport, &config.v2_stage_c, &config.v2_stage_b, &png_example())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractionError::ShapeMismatch { .. }));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn v2_missing_response_field_fails() {
    let matrix = vec![vec![0.5f32; V2_FINAL_SHAPE[1]]; V2_FINAL_SHAPE[0]];
    let transport = ScriptedTransport::new(vec![
        Ok(v2_stage_c_response(8)),
        Ok(vec![json!({ "other_field": matrix })]),
    ]);
    let config = endpoints();
    let err = embedding_v2(&transport, &config.v2_stage_c, &config.v2_stage_b, &png_example())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::MissingField { field: "img_emb" }
    ));
}

#[tokio::test]
async fn transient_error_is_retried_to_success() {
    let stub = Arc::new(ScriptedTransport::new(vec![
        Err(PredictionError::Unavailable),
        Ok(v1_response(V1_EMBEDDING_LEN)),
    ]));
    let transport = RetryingTransport::with_policy(stub.clone(), 3, Duration::from_millis(1));

    let embedding = embedding_v1(&transport, &endpoints().v1, &png_example())
        .await
        .unwrap();
    assert_eq!(embedding.len(), V1_EMBEDDING_LEN);
    assert_eq!(stub.calls(), 2);
}

#[tokio::test]
async fn non_transient_error_aborts_without_retry() {
    let stub = Arc::new(ScriptedTransport::new(vec![Err(PredictionError::Status {
        status: 400,
        body: "bad request".to_owned(),
    })]));
    let transport = RetryingTransport::with_policy(stub.clone(), 3, Duration::from_millis(1));

    let err = embedding_v1(&transport, &endpoints().v1, &png_example())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::Prediction {
            source: PredictionError::Status { status: 400, .. },
            ..
        }
    ));
    assert_eq!(stub.calls(), 1);
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_last_transient_error() {
    let stub = Arc::new(ScriptedTransport::new(vec![
        Err(PredictionError::Unavailable),
        Err(PredictionError::Unavailable),
        Err(PredictionError::Unavailable),
    ]));
    let transport = RetryingTransport::with_policy(stub.clone(), 2, Duration::from_millis(1));

    let err = embedding_v1(&transport, &endpoints().v1, &png_example())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::Prediction {
            source: PredictionError::Unavailable,
            ..
        }
    ));
    // initial attempt plus two retries
    assert_eq!(stub.calls(), 3);
}

fn temp_utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

fn write_input_png(dir: &Utf8PathBuf, name: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, png_bytes()).unwrap();
    path
}

#[tokio::test]
async fn generated_tfrecord_roundtrips_and_drops_image_features() {
    let dir = tempfile::tempdir().unwrap();
    let root = temp_utf8(&dir);
    let input = write_input_png(&root, "study.png");

    let transport = ScriptedTransport::new(vec![Ok(v1_response(V1_EMBEDDING_LEN))]);
    let generator = EmbeddingGenerator::new(
        transport,
        endpoints(),
        ModelVersion::V1,
        InputFileType::Png,
        OutputFileType::Tfrecord,
        false,
    );

    let outcome = generator.generate_one(&input, &root).await.unwrap();
    let output = match outcome {
        GenerateOutcome::Written(path) => path,
        other => panic!("expected written outcome, got {other:?}"),
    };
    assert_eq!(output.file_name(), Some("study.tfrecord"));

    let values = read_tfrecord_values(&output).unwrap();
    assert_eq!(values.len(), V1_EMBEDDING_LEN);
    assert_eq!(values[1].to_bits(), 0.001f32.to_bits());

    let record = read_tfrecord_example(&output).unwrap();
    assert!(record.contains(EMBEDDING_KEY));
    assert!(!record.contains(IMAGE_KEY));
    assert!(!record.contains(IMAGE_FORMAT_KEY));
}

#[tokio::test]
async fn existing_output_is_skipped_without_calling_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let root = temp_utf8(&dir);
    let input = write_input_png(&root, "study.png");
    std::fs::write(root.join("study.npz"), b"already generated").unwrap();

    let transport = Arc::new(ScriptedTransport::new(vec![]));
    let generator = EmbeddingGenerator::new(
        transport.clone(),
        endpoints(),
        ModelVersion::V1,
        InputFileType::Png,
        OutputFileType::Npz,
        false,
    );

    let outcome = generator.generate_one(&input, &root).await.unwrap();
    assert!(matches!(outcome, GenerateOutcome::Skipped(_)));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn overwrite_regenerates_an_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let root = temp_utf8(&dir);
    let input = write_input_png(&root, "study.png");
    std::fs::write(root.join("study.npz"), b"stale").unwrap();

    let transport = Arc::new(ScriptedTransport::new(vec![Ok(v1_response(
        V1_EMBEDDING_LEN,
    ))]));
    let generator = EmbeddingGenerator::new(
        transport.clone(),
        endpoints(),
        ModelVersion::V1,
        InputFileType::Png,
        OutputFileType::Npz,
        true,
    );

    let outcome = generator.generate_one(&input, &root).await.unwrap();
    assert!(matches!(outcome, GenerateOutcome::Written(_)));
    assert_eq!(transport.calls(), 1);

    let values = cxr_embed_core::records::read_npz_values(&root.join("study.npz")).unwrap();
    assert_eq!(values.len(), V1_EMBEDDING_LEN);
}

#[tokio::test]
async fn sequential_batch_stops_at_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let root = temp_utf8(&dir);
    let first = write_input_png(&root, "aaa.png");
    let second = write_input_png(&root, "bbb.png");

    let transport = Arc::new(ScriptedTransport::new(vec![Err(PredictionError::Status {
        status: 403,
        body: "forbidden".to_owned(),
    })]));
    let generator = EmbeddingGenerator::new(
        transport.clone(),
        endpoints(),
        ModelVersion::V1,
        InputFileType::Png,
        OutputFileType::Npz,
        false,
    );

    let err = generator
        .generate_batch(&[first.clone(), second], &root)
        .await
        .unwrap_err();
    assert_eq!(err.path, first);
    assert_eq!(err.stage, "embedding");
    // the failing file halted the batch before the second was attempted
    assert_eq!(transport.calls(), 1);
    assert!(!root.join("bbb.npz").exists());
}

#[tokio::test]
async fn generate_embedding_dispatches_on_model_version() {
    let transport = ScriptedTransport::new(vec![Ok(v1_response(V1_EMBEDDING_LEN))]);
    let embedding = generate_embedding(&transport, &endpoints(), ModelVersion::V1, &png_example())
        .await
        .unwrap();
    assert_eq!(embedding.shape(), [V1_EMBEDDING_LEN]);

    let transport = ScriptedTransport::new(vec![
        Ok(v2_stage_c_response(8)),
        Ok(v2_stage_b_response()),
    ]);
    let embedding = generate_embedding(&transport, &endpoints(), ModelVersion::V2, &png_example())
        .await
        .unwrap();
    assert_eq!(embedding.shape(), V2_FINAL_SHAPE);
}
