use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub cache_key: String,
    pub base_image_ref: String,
    pub architecture: String,
    pub layers: Vec<String>,
}

impl Manifest {
    pub fn new(cache_key: String, base_image_ref: String, architecture: String, layers: Vec<String>) -> Self {
        Manifest {
            version: 1,
            cache_key,
            base_image_ref,
            architecture,
            layers,
        }
    }

    pub fn path(cache_dir: &Path, cache_key: &str) -> std::path::PathBuf {
        cache_dir.join(format!("{cache_key}.manifest.json"))
    }

    /// Writes the manifest, refusing to overwrite an existing manifest with
    /// the same cache key (an existing manifest is a cache hit, never
    /// mutated).
    pub fn write(&self, cache_dir: &Path) -> Result<()> {
        let path = Self::path(cache_dir, &self.cache_key);
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(cache_dir)?;
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn read(cache_dir: &Path, cache_key: &str) -> Result<Option<Self>> {
        let path = Self::path(cache_dir, cache_key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Computes the chained cache key at index `i`: `SHA256(op0 || 0 || op1 ||
/// 0 || ... || opi)`, truncated to 16 bytes, over every op key up to and
/// including index `i`.
pub fn chain_cache_key(op_keys: &[Vec<u8>]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    for (i, key) in op_keys.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(key);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_key_is_order_sensitive() {
        let a = chain_cache_key(&[b"from:alpine".to_vec(), b"run:ls".to_vec()]);
        let b = chain_cache_key(&[b"run:ls".to_vec(), b"from:alpine".to_vec()]);
        assert_ne!(a, b);
    }

    #[test]
    fn chain_key_is_deterministic() {
        let keys = vec![b"from:alpine".to_vec(), b"run:ls".to_vec(), b"copy:x".to_vec()];
        assert_eq!(chain_cache_key(&keys), chain_cache_key(&keys));
    }
}
