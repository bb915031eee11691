use std::error::Error;

use camino::Utf8PathBuf;
use clap::Parser;
use cxr_embed_core::records;

#[derive(Parser, Debug)]
#[command(name = "cxr-show")]
#[command(version = "0.1")]
#[command(about = "prints the embedding values stored in a generated embedding file", long_about = None)]
struct Args {
    /// The .npz or .tfrecord embedding file to read
    file: Utf8PathBuf,
    /// Print every value instead of a leading sample
    #[arg(short, long)]
    all: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let values = match args.file.extension() {
        Some("npz") => records::read_npz_values(&args.file)?,
        Some("tfrecord") => records::read_tfrecord_values(&args.file)?,
        _ => {
            return Err(format!("Unrecognized embedding file extension: {}", args.file).into());
        }
    };

    println!("{} embedding value(s) in {}", values.len(), args.file);
    let shown = if args.all { values.len() } else { values.len().min(8) };
    for (i, value) in values.iter().take(shown).enumerate() {
        println!("{i}: {value}");
    }
    if shown < values.len() {
        println!("... ({} more)", values.len() - shown);
    }

    Ok(())
}
