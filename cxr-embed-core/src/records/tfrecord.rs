//! TFRecord container framing.
//!
//! Each record is stored as:
//! `{length: u64 LE}{masked crc32c(length)}{payload}{masked crc32c(payload)}`
//! where the mask is the rotate-and-add transform TensorFlow applies to raw
//! CRC32C values.

use std::io::{self, Read, Write};

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

pub fn write_record<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let length = (payload.len() as u64).to_le_bytes();
    writer.write_all(&length)?;
    writer.write_all(&masked_crc32c(&length).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.write_all(&masked_crc32c(payload).to_le_bytes())?;
    writer.flush()
}

/// Reads the next record from the stream. Returns `Ok(None)` on a clean end
/// of stream; a checksum mismatch or truncated record is an error.
pub fn read_record<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut length_bytes = [0u8; 8];
    match reader.read_exact(&mut length_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    if u32::from_le_bytes(crc_bytes) != masked_crc32c(&length_bytes) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "tfrecord length checksum mismatch",
        ));
    }

    let length = u64::from_le_bytes(length_bytes) as usize;
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    reader.read_exact(&mut crc_bytes)?;
    if u32::from_le_bytes(crc_bytes) != masked_crc32c(&payload) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "tfrecord payload checksum mismatch",
        ));
    }

    Ok(Some(payload))
}

fn masked_crc32c(bytes: &[u8]) -> u32 {
    let crc = crc32c::crc32c(bytes);
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}
