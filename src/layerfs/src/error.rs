#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed layer index record")]
    MalformedIndex,
    #[error("manifest json: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("layer decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("layer encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("missing or corrupt layer file: {0}")]
    CacheMiss(String),
    #[error("build op {index} failed: {source}")]
    OpFailed { index: usize, source: anyhow::Error },
    #[error("invalid build op chain: {0}")]
    InvalidOpChain(String),
}

pub type Result<T> = std::result::Result<T, Error>;
