use std::{error::Error, sync::Arc, time::Duration};

use camino::Utf8PathBuf;
use clap::Parser;
use cxr_embed_cli::utility::list_input_files;
use cxr_embed_core::{
    app_config,
    embeddings::ModelVersion,
    example::InputFileType,
    generate::{EmbeddingGenerator, GenerateOutcome},
    prediction::{HttpPredictClient, PredictTransport, RetryingTransport},
    records::OutputFileType,
};
use indicatif::ProgressBar;
use log::LevelFilter;
use tokio::{sync::Semaphore, task};

#[derive(Parser, Debug)]
#[command(name = "cxr-generate")]
#[command(version = "0.1")]
#[command(about = "generates chest x-ray embedding files through a hosted prediction service", long_about = None)]
struct Args {
    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,
    /// Folder containing input PNG or DICOM files, or a single input file
    input_path: Utf8PathBuf,
    /// Folder to write output embedding files to
    output_path: Utf8PathBuf,
    /// Only process this many input files. Zero or negative disables the cap
    #[arg(short, long, default_value_t = 100)]
    limit: i64,
    /// Numerical ID of the single-stage embeddings endpoint, overriding the
    /// configured one
    #[arg(long)]
    endpoint_id: Option<u64>,
    /// Project ID that hosts the embeddings API, overriding the configured one
    #[arg(long)]
    embeddings_project: Option<String>,
    /// Location (region) the endpoints are deployed in, overriding the
    /// configured one
    #[arg(long)]
    location: Option<String>,
    /// File type of the input images
    #[arg(long, default_value_t = InputFileType::Png)]
    input_type: InputFileType,
    /// Container format for the output embedding files
    #[arg(long, default_value_t = OutputFileType::Tfrecord)]
    output_type: OutputFileType,
    /// Foundation model version to generate embeddings with
    #[arg(long, default_value_t = ModelVersion::V1)]
    model_version: ModelVersion,
    /// Regenerate output files that already exist
    #[arg(long)]
    overwrite: bool,
    /// Number of parallel generation jobs to run at once. 1 runs the
    /// sequential driver, which stops the batch at the first failure
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    let files = list_input_files(&args.input_path, args.limit);
    if files.is_empty() {
        println!("Nothing to do! Goodbye.");
        return Ok(());
    }

    let mut endpoints = app_config::get_endpoint_config();
    if let Some(project) = &args.embeddings_project {
        for descriptor in [
            &mut endpoints.v1,
            &mut endpoints.v2_stage_c,
            &mut endpoints.v2_stage_b,
        ] {
            descriptor.project = project.clone();
        }
    }
    if let Some(location) = &args.location {
        for descriptor in [
            &mut endpoints.v1,
            &mut endpoints.v2_stage_c,
            &mut endpoints.v2_stage_b,
        ] {
            descriptor.location = location.clone();
        }
    }
    if let Some(endpoint_id) = args.endpoint_id {
        endpoints.v1.endpoint_id = endpoint_id;
    }

    std::fs::create_dir_all(&args.output_path)?;

    let transport = RetryingTransport::new(HttpPredictClient::new(app_config::get_access_token())?);
    let generator = Arc::new(EmbeddingGenerator::new(
        transport,
        endpoints,
        args.model_version,
        args.input_type,
        args.output_type,
        args.overwrite,
    ));

    println!(
        "Generating {} {} embedding file(s) from {} into {} with {} job(s)",
        files.len(),
        args.output_type,
        args.input_path,
        args.output_path,
        args.jobs,
    );

    if args.jobs <= 1 {
        let outcomes = generator.generate_batch(&files, &args.output_path).await?;
        let written = outcomes
            .iter()
            .filter(|o| matches!(o, GenerateOutcome::Written(_)))
            .count();
        println!(
            "{written} file(s) generated, {} file(s) skipped.",
            outcomes.len() - written
        );
        return Ok(());
    }

    let results = spawn_generate_jobs(generator, files, args.output_path, args.jobs).await;
    let mut success = 0;
    let mut fail = 0;
    for result in results {
        if let Ok(()) = result {
            success += 1;
        } else {
            fail += 1;
        }
    }

    println!("{success} file(s) successfully processed, {fail} file(s) failed.");
    if fail > 0 {
        return Err(anyhow::Error::msg("some files failed embedding generation").into());
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    builder.init();
}

/// Fans the per-file generation flow out over independent tasks, bounded by
/// `jobs` concurrent permits. Each file's flow is fully independent, so a
/// failure only marks that file's result slot.
async fn spawn_generate_jobs<T: PredictTransport + 'static>(
    generator: Arc<EmbeddingGenerator<T>>,
    files: Vec<Utf8PathBuf>,
    output_dir: Utf8PathBuf,
    jobs: usize,
) -> Vec<Result<(), ()>> {
    let semaphore = Arc::new(Semaphore::new(jobs));
    let mut handles = vec![];

    let bar = Arc::new(ProgressBar::new(files.len().try_into().unwrap()));
    bar.enable_steady_tick(Duration::from_secs(1));
    bar.tick();

    for file in files {
        let permit = semaphore.clone().acquire_owned().await.unwrap_or_else(|e| {
            panic!("Failed to acquire semaphore permit (was the semaphore closed?): {e:?}")
        });
        let generator_clone = generator.clone();
        let output_dir_clone = output_dir.clone();
        let bar_clone = bar.clone();
        let handle = task::spawn(async move {
            let result = generator_clone.generate_one(&file, &output_dir_clone).await;

            drop(permit); // Release the permit when done
            bar_clone.inc(1);
            match result {
                Ok(GenerateOutcome::Written(path)) => {
                    bar_clone.println(format!("File {path} successfully generated"));
                    Ok(())
                }
                Ok(GenerateOutcome::Skipped(path)) => {
                    bar_clone.println(format!("Output {path} already exists, skipped"));
                    Ok(())
                }
                Err(e) => {
                    bar_clone.println(format!(
                        "Error while processing file with path {:?}: {:?}",
                        e.path,
                        e.source()
                    ));
                    Err(())
                }
            }
        });
        handles.push(handle);
    }

    let mut results = vec![];
    for handle in handles {
        results.push(handle.await.unwrap_or(Err(())));
    }

    bar.finish();

    results
}
