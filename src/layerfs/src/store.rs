use std::path::Path;

use crate::entry::{self, LayerEntry};
use crate::error::{Error, Result};

/// Writes a captured layer's index and content files, keyed by the
/// content-addressed hash of the serialized index. Returns that hash.
/// Writing is idempotent: an existing `<hash>.idx` is assumed identical
/// and never rewritten.
pub fn write_layer(cache_dir: &Path, entries: &[LayerEntry], contents: &[u8]) -> Result<String> {
    let index_bytes = entry::encode_index(entries)?;
    let hash = entry::content_hash(&index_bytes);

    std::fs::create_dir_all(cache_dir)?;
    let idx_path = cache_dir.join(format!("{hash}.idx"));
    let contents_path = cache_dir.join(format!("{hash}.contents"));
    if !idx_path.exists() {
        std::fs::write(&idx_path, &index_bytes)?;
    }
    if !contents_path.exists() {
        std::fs::write(&contents_path, contents)?;
    }
    Ok(hash)
}

pub fn read_layer(cache_dir: &Path, hash: &str) -> Result<(Vec<LayerEntry>, Vec<u8>)> {
    let idx_path = cache_dir.join(format!("{hash}.idx"));
    let contents_path = cache_dir.join(format!("{hash}.contents"));

    let index_bytes = std::fs::read(&idx_path).map_err(|_| Error::CacheMiss(hash.to_string()))?;
    let contents = std::fs::read(&contents_path).map_err(|_| Error::CacheMiss(hash.to_string()))?;
    let entries = entry::decode_index(&index_bytes).map_err(|_| Error::CacheMiss(hash.to_string()))?;

    Ok((entries, contents))
}
