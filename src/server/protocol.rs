//! Framed request/response envelopes: a 4-byte little-endian length
//! prefix followed by a bincode-serialized envelope. Connections are
//! short-lived and strictly request/response.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Streaming chunk ceiling; frames above this (plus envelope slack) are
/// rejected as malformed.
pub const MAX_CHUNK: usize = 16 * 1024 * 1024;
const MAX_FRAME: usize = MAX_CHUNK + 4096;

/// Default chunk size used when streaming weight buffers.
pub const DEFAULT_CHUNK: usize = 4 * 1024 * 1024;

pub const STATUS_VERSION_MISMATCH: u32 = 1;
pub const STATUS_BAD_REQUEST: u32 = 2;
pub const STATUS_INTERNAL: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    GetWeights {
        version: Option<String>,
        position: u64,
    },
    SetWeights {
        version: Option<String>,
        buffer: Vec<u8>,
        complete: bool,
    },
    UpdWeights {
        version: Option<String>,
        buffer: Vec<u8>,
        complete: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    GetWeights {
        version: String,
        buffer: Vec<u8>,
        complete: bool,
    },
    SetWeights {
        version: String,
    },
    UpdWeights {
        version: String,
    },
    Success,
    Error {
        status: u32,
        message: String,
    },
}

pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, message: &T) -> Result<()> {
    let payload =
        bincode::serialize(message).map_err(|e| Error::Codec(format!("frame encode: {e}")))?;
    if payload.len() > MAX_FRAME {
        return Err(Error::Codec(format!("frame too large: {}", payload.len())));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(Error::Codec(format!("frame too large: {len}")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    bincode::deserialize(&payload).map_err(|e| Error::Codec(format!("frame decode: {e}")))
}
