//! Builds structured image records from raw chest X-ray files.
//!
//! A record carries the grayscale PNG bytes of the study plus a format tag,
//! modelled on the `tensorflow.Example` feature map that the embedding
//! endpoints expect. DICOM studies are validated against the accepted frontal
//! view positions before any pixel data is decoded.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use camino::Utf8Path;
use dicom_dictionary_std::tags;
use dicom_pixeldata::PixelDecoder;
use image::{DynamicImage, ImageFormat};
use log::debug;
use prost::Message;

use crate::proto;

/// Feature key holding the encoded image bytes.
pub const IMAGE_KEY: &str = "image/encoded";
/// Feature key holding the image format tag.
pub const IMAGE_FORMAT_KEY: &str = "image/format";
/// Feature key the embedding values are stored under.
pub const EMBEDDING_KEY: &str = "embedding";

const FRONTAL_VIEW_POSITIONS: [&str; 2] = ["AP", "PA"];
const DICOM_PREAMBLE_LEN: usize = 128;
const DICOM_MAGIC: &[u8] = b"DICM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFileType {
    Png,
    Dicom,
}

impl fmt::Display for InputFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputFileType::Png => write!(f, "png"),
            InputFileType::Dicom => write!(f, "dicom"),
        }
    }
}

impl FromStr for InputFileType {
    type Err = ExampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "png" => Ok(InputFileType::Png),
            "dicom" => Ok(InputFileType::Dicom),
            other => Err(ExampleError::UnsupportedType {
                selector: other.to_owned(),
            }),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExampleError {
    #[error("Unsupported input file type: {selector:?}")]
    UnsupportedType { selector: String },
    #[error(
        "View position {view_position:?} is not in the accepted frontal set {FRONTAL_VIEW_POSITIONS:?}"
    )]
    NonFrontalView { view_position: String },
    #[error("Error interacting with file at {path}")]
    IO {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Error decoding image data at step: {step}")]
    Decode {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// A structured record of named features built from one input image.
///
/// Immutable after construction except for the single mutation the serializer
/// performs: appending the embedding values and dropping the raw-image
/// features before the record is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageExample {
    example: proto::Example,
}

impl ImageExample {
    fn empty() -> Self {
        ImageExample {
            example: proto::Example {
                features: Some(proto::Features::default()),
            },
        }
    }

    /// Decodes PNG bytes, converts to 8-bit grayscale and wraps the
    /// re-encoded pixels into a record.
    pub fn from_png_bytes(bytes: &[u8]) -> Result<Self, ExampleError> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Png).map_err(|e| {
            ExampleError::Decode {
                step: "png decode",
                source: e.into(),
            }
        })?;
        Self::from_dynamic_image(image)
    }

    /// Parses a DICOM study, rejects non-frontal view positions, and converts
    /// the pixel data into a grayscale record.
    ///
    /// A study without a `ViewPosition` attribute is accepted; only a present
    /// attribute outside the frontal set fails validation.
    pub fn from_dicom_bytes(bytes: &[u8]) -> Result<Self, ExampleError> {
        // File sets carry a 128-byte preamble before the "DICM" magic, raw
        // data sets do not. from_reader expects the magic first.
        let data = if bytes.len() > DICOM_PREAMBLE_LEN + DICOM_MAGIC.len()
            && &bytes[DICOM_PREAMBLE_LEN..DICOM_PREAMBLE_LEN + DICOM_MAGIC.len()] == DICOM_MAGIC
        {
            &bytes[DICOM_PREAMBLE_LEN..]
        } else {
            bytes
        };

        let object = dicom_object::from_reader(Cursor::new(data)).map_err(|e| {
            ExampleError::Decode {
                step: "dicom parse",
                source: e.into(),
            }
        })?;

        let view_position = object
            .element_opt(tags::VIEW_POSITION)
            .map_err(|e| ExampleError::Decode {
                step: "dicom attribute read",
                source: e.into(),
            })?
            .and_then(|element| element.to_str().ok())
            .map(|value| value.trim().to_owned());
        check_frontal(view_position.as_deref())?;

        let decoded = object
            .decode_pixel_data()
            .map_err(|e| ExampleError::Decode {
                step: "dicom pixel decode",
                source: e.into(),
            })?;
        let image = decoded
            .to_dynamic_image(0)
            .map_err(|e| ExampleError::Decode {
                step: "dicom pixel conversion",
                source: e.into(),
            })?;
        Self::from_dynamic_image(image)
    }

    fn from_dynamic_image(image: DynamicImage) -> Result<Self, ExampleError> {
        let grayscale = DynamicImage::ImageLuma8(image.to_luma8());
        let mut png_bytes = Vec::new();
        grayscale
            .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
            .map_err(|e| ExampleError::Decode {
                step: "png encode",
                source: e.into(),
            })?;

        let mut example = Self::empty();
        example.put_bytes(IMAGE_KEY, png_bytes);
        example.put_bytes(IMAGE_FORMAT_KEY, b"png".to_vec());
        Ok(example)
    }

    pub fn put_bytes(&mut self, key: &str, value: Vec<u8>) {
        self.features_mut().feature.insert(
            key.to_owned(),
            proto::Feature {
                kind: Some(proto::feature::Kind::BytesList(proto::BytesList {
                    value: vec![value],
                })),
            },
        );
    }

    pub fn put_floats(&mut self, key: &str, value: Vec<f32>) {
        self.features_mut().feature.insert(
            key.to_owned(),
            proto::Feature {
                kind: Some(proto::feature::Kind::FloatList(proto::FloatList { value })),
            },
        );
    }

    pub fn remove(&mut self, key: &str) {
        self.features_mut().feature.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.features()
            .map(|f| f.feature.contains_key(key))
            .unwrap_or(false)
    }

    /// Returns the float-list values stored under `key`, if any.
    pub fn float_values(&self, key: &str) -> Option<&[f32]> {
        match self.features()?.feature.get(key)?.kind.as_ref()? {
            proto::feature::Kind::FloatList(list) => Some(&list.value),
            _ => None,
        }
    }

    /// Serializes the record to its proto wire encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.example.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ExampleError> {
        let example = proto::Example::decode(bytes).map_err(|e| ExampleError::Decode {
            step: "example proto decode",
            source: e.into(),
        })?;
        Ok(ImageExample { example })
    }

    fn features(&self) -> Option<&proto::Features> {
        self.example.features.as_ref()
    }

    fn features_mut(&mut self) -> &mut proto::Features {
        self.example
            .features
            .get_or_insert_with(proto::Features::default)
    }
}

/// Reads an image file and builds a record from it according to the declared
/// input type. No side effects beyond the file read.
pub fn build_example(path: &Utf8Path, input_type: InputFileType) -> Result<ImageExample, ExampleError> {
    debug!("Building {input_type} example from file at path: {path}");
    let bytes = std::fs::read(path).map_err(|e| ExampleError::IO {
        path: path.to_string(),
        source: e.into(),
    })?;

    match input_type {
        InputFileType::Png => ImageExample::from_png_bytes(&bytes),
        InputFileType::Dicom => ImageExample::from_dicom_bytes(&bytes),
    }
}

// private functions and variables

fn check_frontal(view_position: Option<&str>) -> Result<(), ExampleError> {
    match view_position {
        Some(vp) if !FRONTAL_VIEW_POSITIONS.contains(&vp) => Err(ExampleError::NonFrontalView {
            view_position: vp.to_owned(),
        }),
        _ => Ok(()),
    }
}
