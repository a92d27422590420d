//! Wire format for the host/guest command channel: one `Frame` per message,
//! 4-byte little-endian length prefix, bincode body. Shared between the
//! guest-side listener (`vinit`) and the host-side driver (`vmcore`) so
//! both sides decode the exact same type.

use serde::{Deserialize, Serialize};

pub const BOOT_PORT: u32 = 9000;
pub const COMMAND_PORT: u32 = 9001;

#[derive(Debug, Serialize, Deserialize)]
pub enum Frame {
    BootComplete,
    Exec {
        path: String,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        cwd: String,
    },
    ExecResult {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    /// Decodes one frame's body (the length prefix is a transport concern,
    /// stripped by the caller).
    pub fn decode(body: &[u8]) -> Result<Frame, CodecError> {
        let (frame, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        Ok(frame)
    }
}
