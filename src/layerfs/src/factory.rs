//! C8: builds a filesystem snapshot from an ordered operation plan,
//! short-circuiting on any cached prefix of the chain.
//!
//! Running an op requires a live instance (guest exec for `Run`, host
//! read + guest `WriteFile` for `Copy`). To avoid this crate depending on
//! the VM orchestration crate that owns instances, the driving side is
//! inverted: the orchestrator implements [`BuildContext`]/[`BuildInstance`]
//! and hands them to [`build`].

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::capture::Excludes;
use crate::entry::LayerEntry;
use crate::error::{Error, Result};
use crate::manifest::{self, Manifest};
use crate::store;

#[derive(Debug, Clone)]
pub enum Op {
    From {
        image_ref: String,
    },
    Run {
        argv: Vec<String>,
        env: Vec<(String, String)>,
        workdir: String,
        user: String,
    },
    Copy {
        host_path: PathBuf,
        guest_path: String,
    },
}

impl Op {
    /// A deterministic key over this op's inputs. `Copy` folds in a
    /// SHA-256 of the source file's content so a changed source busts the
    /// cache even when the op's textual description hasn't changed.
    pub fn cache_key(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        match self {
            Op::From { image_ref } => {
                hasher.update(b"from\0");
                hasher.update(image_ref.as_bytes());
            }
            Op::Run { argv, env, workdir, user } => {
                hasher.update(b"run\0");
                for arg in argv {
                    hasher.update(arg.as_bytes());
                    hasher.update(b"\0");
                }
                for (k, v) in env {
                    hasher.update(k.as_bytes());
                    hasher.update(b"=");
                    hasher.update(v.as_bytes());
                    hasher.update(b"\0");
                }
                hasher.update(workdir.as_bytes());
                hasher.update(b"\0");
                hasher.update(user.as_bytes());
            }
            Op::Copy { host_path, guest_path } => {
                hasher.update(b"copy\0");
                let content = std::fs::read(host_path).unwrap_or_default();
                hasher.update(Sha256::digest(&content));
                hasher.update(guest_path.as_bytes());
            }
        }
        hasher.finalize().to_vec()
    }
}

/// A live instance driven by the build algorithm. Implemented by the VM
/// orchestration crate.
pub trait BuildInstance {
    fn run(&mut self, argv: &[String], env: &[(String, String)], workdir: &str, user: &str) -> anyhow::Result<()>;
    fn write_file(&mut self, guest_path: &str, data: &[u8]) -> anyhow::Result<()>;
    fn capture(&self, excludes: &Excludes) -> (Vec<LayerEntry>, Vec<u8>);
    fn close(self) -> anyhow::Result<()>;
}

/// The orchestrator's side of the build: fetching base images and booting
/// instances against a layer stack.
pub trait BuildContext {
    type Instance: BuildInstance;

    fn ensure_base(&self, image_ref: &str) -> anyhow::Result<()>;
    fn instantiate(&self, base_image_ref: &str, architecture: &str, layers: &[String]) -> anyhow::Result<Self::Instance>;
}

/// Runs the build algorithm (spec §4.8): validates the chain starts with
/// `From`, resolves the deepest cached prefix, and drives the remaining
/// ops one instance at a time, persisting a manifest after each.
pub fn build<C: BuildContext>(
    ctx: &C,
    cache_dir: &Path,
    ops: &[Op],
    base_image_ref: &str,
    architecture: &str,
    excludes: &Excludes,
) -> Result<Manifest> {
    if !matches!(ops.first(), Some(Op::From { .. })) {
        return Err(Error::InvalidOpChain("first op must be From".into()));
    }

    let op_keys: Vec<Vec<u8>> = ops.iter().map(Op::cache_key).collect();
    let full_key = manifest::hex(&manifest::chain_cache_key(&op_keys));

    if let Some(existing) = Manifest::read(cache_dir, &full_key)? {
        return Ok(existing);
    }

    ctx.ensure_base(base_image_ref)
        .map_err(|source| Error::OpFailed { index: 0, source })?;

    let mut layers: Vec<String> = Vec::new();
    let mut start = 1;
    for i in (1..ops.len()).rev() {
        let partial_key = manifest::hex(&manifest::chain_cache_key(&op_keys[..=i]));
        if let Some(existing) = Manifest::read(cache_dir, &partial_key)? {
            layers = existing.layers;
            start = i + 1;
            break;
        }
    }

    let mut final_manifest: Option<Manifest> = None;

    for (i, op) in ops.iter().enumerate().skip(start) {
        let mut instance = ctx
            .instantiate(base_image_ref, architecture, &layers)
            .map_err(|source| Error::OpFailed { index: i, source })?;

        let applied = match op {
            Op::From { .. } => Err(anyhow::anyhow!("From is only valid as the first op")),
            Op::Run { argv, env, workdir, user } => instance.run(argv, env, workdir, user),
            Op::Copy { host_path, guest_path } => std::fs::read(host_path)
                .map_err(anyhow::Error::from)
                .and_then(|data| instance.write_file(guest_path, &data)),
        };
        if let Err(source) = applied {
            return Err(Error::OpFailed { index: i, source });
        }

        let (entries, contents) = instance.capture(excludes);
        instance.close().map_err(|source| Error::OpFailed { index: i, source })?;

        let hash = store::write_layer(cache_dir, &entries, &contents)?;
        layers.push(hash);

        let key = manifest::hex(&manifest::chain_cache_key(&op_keys[..=i]));
        let m = Manifest::new(key, base_image_ref.to_string(), architecture.to_string(), layers.clone());
        m.write(cache_dir)?;
        final_manifest = Some(m);
    }

    match final_manifest {
        Some(m) => Ok(m),
        None => {
            // Chain was just `From`: the final state is the bare base.
            let m = Manifest::new(full_key, base_image_ref.to_string(), architecture.to_string(), layers);
            m.write(cache_dir)?;
            Ok(m)
        }
    }
}
