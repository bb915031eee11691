//! Persists embedding vectors to durable storage and reads them back.
//!
//! Two container formats are supported and matched exhaustively: a compressed
//! array file (`.npz`) holding a single array keyed `embedding`, and a
//! tensor-record file (`.tfrecord`) holding one serialized record with the
//! embedding merged in and the raw-image features stripped. The readers exist
//! for inspection tooling and round-trip tests; they assume files produced by
//! this crate.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::str::FromStr;

use camino::Utf8Path;
use log::debug;
use ndarray::{Array1, ArrayD};

use crate::example::{ImageExample, EMBEDDING_KEY, IMAGE_FORMAT_KEY, IMAGE_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFileType {
    Npz,
    Tfrecord,
}

impl OutputFileType {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFileType::Npz => "npz",
            OutputFileType::Tfrecord => "tfrecord",
        }
    }
}

impl fmt::Display for OutputFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFileType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "npz" => Ok(OutputFileType::Npz),
            "tfrecord" => Ok(OutputFileType::Tfrecord),
            other => Err(RecordError::UnknownFormat {
                selector: other.to_owned(),
            }),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("Unknown output file type: {selector:?}")]
    UnknownFormat { selector: String },
    #[error("Saving as tfrecord requires the original image example")]
    MissingExample,
    #[error("Error interacting with file at {path}")]
    IO {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Error encoding embedding container at {path}")]
    Encode {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Embedding container at {path} is malformed: {msg}")]
    Malformed { path: String, msg: &'static str },
}

/// Writes the embedding to `output_file` in the requested container format.
///
/// The vector is flattened to 1-D before writing. The tfrecord format merges
/// the values into the original record under [`EMBEDDING_KEY`] and removes
/// the raw-image features so they are not re-serialized; the original record
/// is therefore required for that format and its absence is an error.
pub fn save_embedding(
    embedding: &ArrayD<f32>,
    output_file: &Utf8Path,
    format: OutputFileType,
    image_example: Option<ImageExample>,
) -> Result<(), RecordError> {
    let flattened: Array1<f32> = Array1::from_iter(embedding.iter().copied());
    debug!(
        "Saving embedding of {} value(s) as {format} to {output_file}",
        flattened.len()
    );

    match format {
        OutputFileType::Npz => write_npz(&flattened, output_file),
        OutputFileType::Tfrecord => {
            let mut example = image_example.ok_or(RecordError::MissingExample)?;
            example.put_floats(EMBEDDING_KEY, flattened.to_vec());
            // Drop the transport-only features so they are not persisted
            example.remove(IMAGE_FORMAT_KEY);
            example.remove(IMAGE_KEY);
            write_tfrecord(&example, output_file)
        }
    }
}

/// Reads the embedding values from a `.npz` file written by this crate.
pub fn read_npz_values(path: &Utf8Path) -> Result<Array1<f32>, RecordError> {
    let file = File::open(path).map_err(|e| RecordError::IO {
        path: path.to_string(),
        source: e.into(),
    })?;
    let mut npz = ndarray_npy::NpzReader::new(file).map_err(|e| RecordError::Encode {
        path: path.to_string(),
        source: e.into(),
    })?;
    npz.by_name(EMBEDDING_KEY).map_err(|e| RecordError::Encode {
        path: path.to_string(),
        source: e.into(),
    })
}

/// Reads the single record contained in a `.tfrecord` embedding file.
pub fn read_tfrecord_example(path: &Utf8Path) -> Result<ImageExample, RecordError> {
    let file = File::open(path).map_err(|e| RecordError::IO {
        path: path.to_string(),
        source: e.into(),
    })?;
    let mut reader = BufReader::new(file);
    let payload = tfrecord::read_record(&mut reader)
        .map_err(|e| RecordError::IO {
            path: path.to_string(),
            source: e.into(),
        })?
        .ok_or(RecordError::Malformed {
            path: path.to_string(),
            msg: "file contains no records",
        })?;
    ImageExample::from_bytes(&payload).map_err(|e| RecordError::Encode {
        path: path.to_string(),
        source: e.into(),
    })
}

/// Reads the embedding values from a `.tfrecord` file written by this crate.
pub fn read_tfrecord_values(path: &Utf8Path) -> Result<Array1<f32>, RecordError> {
    let example = read_tfrecord_example(path)?;
    let values = example
        .float_values(EMBEDDING_KEY)
        .ok_or(RecordError::Malformed {
            path: path.to_string(),
            msg: "record does not contain an embedding feature",
        })?;
    Ok(Array1::from_vec(values.to_vec()))
}

// private functions and variables

fn write_npz(values: &Array1<f32>, path: &Utf8Path) -> Result<(), RecordError> {
    let file = File::create(path).map_err(|e| RecordError::IO {
        path: path.to_string(),
        source: e.into(),
    })?;
    let mut npz = ndarray_npy::NpzWriter::new_compressed(file);
    npz.add_array(EMBEDDING_KEY, values)
        .map_err(|e| RecordError::Encode {
            path: path.to_string(),
            source: e.into(),
        })?;
    npz.finish().map_err(|e| RecordError::Encode {
        path: path.to_string(),
        source: e.into(),
    })?;
    Ok(())
}

fn write_tfrecord(example: &ImageExample, path: &Utf8Path) -> Result<(), RecordError> {
    let file = File::create(path).map_err(|e| RecordError::IO {
        path: path.to_string(),
        source: e.into(),
    })?;
    let mut writer = BufWriter::new(file);
    tfrecord::write_record(&mut writer, &example.to_bytes()).map_err(|e| RecordError::IO {
        path: path.to_string(),
        source: e.into(),
    })
}

mod tfrecord;
