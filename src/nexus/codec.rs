//! Binary codec for nexus descriptors.
//!
//! Format:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ValidationError;

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Largest payload accepted by [`decode`].
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 1 + 4;
const TRAILER_LEN: usize = 4;

fn invalid(reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidDescriptor { reason: reason.into() }
}

/// Serializes a value with a version byte, length prefix and checksum.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ValidationError> {
    let data = serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(invalid(format!(
            "payload size {} exceeds maximum {MAX_PAYLOAD_SIZE}",
            data.len()
        )));
    }
    let len = u32::try_from(data.len()).map_err(|_| invalid("payload too large"))?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(HEADER_LEN + data.len() + TRAILER_LEN);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Deserializes a value, verifying version, length and checksum.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ValidationError> {
    let (&version, rest) = bytes.split_first().ok_or_else(|| invalid("empty input"))?;
    if version != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {version} (expected {CODEC_VERSION})"
        )));
    }

    let len_bytes: [u8; 4] = rest
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| invalid("truncated length"))?;
    let len = usize::try_from(u32::from_le_bytes(len_bytes)).map_err(|_| invalid("length overflow"))?;
    if len > MAX_PAYLOAD_SIZE {
        return Err(invalid(format!("payload size {len} exceeds maximum {MAX_PAYLOAD_SIZE}")));
    }

    let body = &rest[4..];
    if body.len() != len + TRAILER_LEN {
        return Err(invalid(format!(
            "length mismatch: header says {len}, found {}",
            body.len().saturating_sub(TRAILER_LEN)
        )));
    }
    let (data, crc_bytes) = body.split_at(len);
    let mut stored = [0u8; 4];
    stored.copy_from_slice(crc_bytes);
    let stored_crc = u32::from_le_bytes(stored);

    let mut hasher = Hasher::new();
    hasher.update(data);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"
        )));
    }

    serde_json::from_slice(data).map_err(|e| invalid(format!("deserialization failed: {e}")))
}
