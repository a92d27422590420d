//! Container image layering: capturing an overlay's changes into a
//! content-addressed layer, stacking layers read-only over a base image
//! (C7), and building a layer stack from an ordered operation plan with
//! chained cache-key short-circuiting (C8).

pub mod capture;
pub mod entry;
pub mod error;
pub mod factory;
pub mod layered;
pub mod manifest;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use devices::virtio::fs::{AbstractNode, WalkEntry};

pub use capture::Excludes;
pub use entry::{EntryKind, LayerEntry};
pub use error::{Error, Result};
pub use factory::{build, BuildContext, BuildInstance, Op};
pub use layered::LayeredFs;
pub use manifest::Manifest;

/// C9's `SnapshotFilesystem(opts)`, delegating to the capture + persistence
/// machinery. `cache_key` is supplied by the caller (typically a content
/// hash or build-chain fingerprint); an existing manifest under that key is
/// returned unchanged rather than recaptured.
pub fn snapshot_filesystem(
    walk: Vec<WalkEntry>,
    excludes: &Excludes,
    cache_dir: &Path,
    cache_key: &str,
    base_image_ref: &str,
    architecture: &str,
    parent_layers: &[String],
) -> Result<Manifest> {
    if let Some(existing) = Manifest::read(cache_dir, cache_key)? {
        return Ok(existing);
    }

    let (entries, contents) = capture::capture_layer(walk, excludes);
    let hash = store::write_layer(cache_dir, &entries, &contents)?;

    let mut layers = parent_layers.to_vec();
    layers.push(hash);

    let m = Manifest::new(cache_key.to_string(), base_image_ref.to_string(), architecture.to_string(), layers);
    m.write(cache_dir)?;
    Ok(m)
}

/// Reads every layer a manifest references and stacks them over `base`
/// (C5's restore step / C7 construction).
pub fn restore(cache_dir: &Path, manifest: &Manifest, base: Arc<dyn AbstractNode>) -> Result<LayeredFs> {
    let mut layers = Vec::with_capacity(manifest.layers.len());
    for hash in &manifest.layers {
        layers.push(store::read_layer(cache_dir, hash)?);
    }
    Ok(LayeredFs::new(base, layers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devices::virtio::fs::NodeKind;

    fn walk_entry(path: &str, content: &[u8]) -> WalkEntry {
        WalkEntry {
            path: path.as_bytes().to_vec(),
            kind: NodeKind::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: 0,
            content: content.to_vec(),
            linkname: Vec::new(),
            deleted: false,
        }
    }

    #[test]
    fn snapshot_is_idempotent_on_cache_key() {
        let dir = std::env::temp_dir().join(format!("layerfs-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let walk = vec![walk_entry("file.txt", b"hello")];
        let m1 = snapshot_filesystem(walk.clone(), &Excludes::empty(), &dir, "deadbeef", "alpine:3.19", "arm64", &[]).unwrap();
        let m2 = snapshot_filesystem(walk, &Excludes::empty(), &dir, "deadbeef", "alpine:3.19", "arm64", &[]).unwrap();
        assert_eq!(m1.cache_key, m2.cache_key);
        assert_eq!(m1.layers, m2.layers);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn restore_reconstructs_written_content() {
        let dir = std::env::temp_dir().join(format!("layerfs-test-restore-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let walk = vec![walk_entry("file.txt", b"hello from layer")];
        let m = snapshot_filesystem(walk, &Excludes::empty(), &dir, "cachekey1", "alpine:3.19", "arm64", &[]).unwrap();

        let base = Arc::new(devices::virtio::fs::DirBacking::new(dir.clone()));
        let layered = restore(&dir, &m, base).unwrap();
        let node = layered.lookup(b"file.txt").expect("file.txt should resolve through the layer");
        assert_eq!(node.read(0, 64), b"hello from layer");

        std::fs::remove_dir_all(&dir).ok();
    }
}
