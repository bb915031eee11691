//! Drives the full per-file embedding flow: build a record from the input
//! image, run the extraction variant against the prediction service, and
//! persist the result.
//!
//! The sequential batch driver processes one file at a time and deliberately
//! stops the run on the first per-file error; outputs already written are
//! preserved and a re-run skips them. Concurrent fan-out over independent
//! files is the caller's concern (each file's flow shares no mutable state),
//! see the CLI's job spawner.

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info};
use tokio::task;

use crate::embeddings::{generate_embedding, EndpointConfig, ModelVersion};
use crate::example::{build_example, InputFileType};
use crate::prediction::PredictTransport;
use crate::records::{save_embedding, OutputFileType};

#[derive(thiserror::Error, Debug)]
#[error("Error occurred while generating embedding for file at stage: {stage}")]
pub struct GenerateError {
    /// The input file being processed when the error occurred
    pub path: Utf8PathBuf,
    /// The flow stage that failed
    pub stage: &'static str,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// The embedding file was generated.
    Written(Utf8PathBuf),
    /// An output file already existed and overwrite was not requested.
    Skipped(Utf8PathBuf),
}

/// Orchestrates embedding generation for input image files.
pub struct EmbeddingGenerator<T> {
    transport: T,
    endpoints: EndpointConfig,
    model_version: ModelVersion,
    input_type: InputFileType,
    output_type: OutputFileType,
    overwrite_existing: bool,
}

impl<T: PredictTransport> EmbeddingGenerator<T> {
    pub fn new(
        transport: T,
        endpoints: EndpointConfig,
        model_version: ModelVersion,
        input_type: InputFileType,
        output_type: OutputFileType,
        overwrite_existing: bool,
    ) -> Self {
        EmbeddingGenerator {
            transport,
            endpoints,
            model_version,
            input_type,
            output_type,
            overwrite_existing,
        }
    }

    /// Output path for an input file: the input's base name with the output
    /// format's extension, under `output_dir`.
    pub fn output_file_name(&self, input_file: &Utf8Path, output_dir: &Utf8Path) -> Utf8PathBuf {
        let base = input_file.file_stem().unwrap_or("embedding");
        output_dir.join(format!("{base}.{}", self.output_type.extension()))
    }

    /// Runs the full flow for one input file.
    ///
    /// If the output file already exists and overwrite was not requested the
    /// file is skipped without contacting the prediction service, which makes
    /// batch runs resumable.
    pub async fn generate_one(
        &self,
        input_file: &Utf8Path,
        output_dir: &Utf8Path,
    ) -> Result<GenerateOutcome, GenerateError> {
        let output_file = self.output_file_name(input_file, output_dir);
        if !self.overwrite_existing && output_file.exists() {
            info!("Found existing output file. Skipping: {output_file}");
            return Ok(GenerateOutcome::Skipped(output_file));
        }

        debug!("EmbeddingGenerator: Building example for file at path: {input_file}");
        let input = input_file.to_owned();
        let input_type = self.input_type;
        let example = task::spawn_blocking(move || build_example(&input, input_type))
            .await // this is Result<Result<example, build_error>, tokio::task_error>
            .map_err(|e| GenerateError {
                path: input_file.to_owned(),
                stage: "example",
                source: e.into(),
            })?
            .map_err(|e| GenerateError {
                path: input_file.to_owned(),
                stage: "example",
                source: e.into(),
            })?;

        debug!("EmbeddingGenerator: Requesting {} embedding for: {input_file}", self.model_version);
        let embedding = generate_embedding(
            &self.transport,
            &self.endpoints,
            self.model_version,
            &example,
        )
        .await
        .map_err(|e| GenerateError {
            path: input_file.to_owned(),
            stage: "embedding",
            source: e.into(),
        })?;

        // Only the tfrecord format needs the original record to merge into
        let original = (self.output_type == OutputFileType::Tfrecord).then(|| example.clone());
        save_embedding(&embedding, &output_file, self.output_type, original).map_err(|e| {
            GenerateError {
                path: input_file.to_owned(),
                stage: "save",
                source: e.into(),
            }
        })?;

        info!("Successfully generated {output_file}");
        Ok(GenerateOutcome::Written(output_file))
    }

    /// Sequential batch driver. Stops at the first per-file error; outcomes
    /// for files already processed are not rolled back.
    pub async fn generate_batch(
        &self,
        input_files: &[Utf8PathBuf],
        output_dir: &Utf8Path,
    ) -> Result<Vec<GenerateOutcome>, GenerateError> {
        let mut outcomes = Vec::with_capacity(input_files.len());
        for file in input_files {
            outcomes.push(self.generate_one(file, output_dir).await?);
        }
        Ok(outcomes)
    }
}
