//! C7: stacks zero or more snapshot layers, oldest-to-newest, over a base
//! abstract directory. Strictly read-only — writes to a mounted instance
//! of this go through the overlay above it and only become durable through
//! a fresh snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use devices::virtio::fs::{AbstractNode, NodeKind};

use crate::entry::{EntryKind, LayerEntry};

struct Layer {
    entries: std::collections::HashMap<String, LayerEntry>,
    contents: Arc<Vec<u8>>,
}

struct Shared {
    /// Oldest first; `lookup` walks this in reverse so the newest layer
    /// wins on conflicting paths.
    layers: Vec<Layer>,
}

/// The root of a layered container filesystem. Implements `AbstractNode`
/// so it can be wired directly as a `CowFs` backing.
pub struct LayeredFs {
    root: LayeredNode,
}

impl LayeredFs {
    pub fn new(base: Arc<dyn AbstractNode>, layers: Vec<(Vec<LayerEntry>, Vec<u8>)>) -> Self {
        let layers = layers
            .into_iter()
            .map(|(entries, contents)| Layer {
                entries: entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
                contents: Arc::new(contents),
            })
            .collect();
        let shared = Arc::new(Shared { layers });
        let root = LayeredNode {
            shared,
            path: String::new(),
            base_here: Some(base),
            layer_entry: None,
        };
        LayeredFs { root }
    }
}

impl AbstractNode for LayeredFs {
    fn kind(&self) -> NodeKind {
        self.root.kind()
    }
    fn size(&self) -> u64 {
        self.root.size()
    }
    fn mode(&self) -> u32 {
        self.root.mode()
    }
    fn mtime(&self) -> u64 {
        self.root.mtime()
    }
    fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        self.root.read(offset, len)
    }
    fn readlink(&self) -> Vec<u8> {
        self.root.readlink()
    }
    fn lookup(&self, name: &[u8]) -> Option<Arc<dyn AbstractNode>> {
        self.root.lookup(name)
    }
    fn readdir(&self) -> Vec<(Vec<u8>, Arc<dyn AbstractNode>)> {
        self.root.readdir()
    }
}

#[derive(Clone)]
struct LayeredNode {
    shared: Arc<Shared>,
    path: String,
    base_here: Option<Arc<dyn AbstractNode>>,
    layer_entry: Option<(LayerEntry, Arc<Vec<u8>>)>,
}

impl LayeredNode {
    fn child_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.path)
        }
    }

    /// Finds the newest layer entry for `path`, if any, walking layers
    /// newest-first per the lookup algorithm.
    fn find_layer_entry(&self, path: &str) -> Option<(LayerEntry, Arc<Vec<u8>>)> {
        for layer in self.shared.layers.iter().rev() {
            if let Some(entry) = layer.entries.get(path) {
                return Some((entry.clone(), layer.contents.clone()));
            }
        }
        None
    }
}

impl AbstractNode for LayeredNode {
    fn kind(&self) -> NodeKind {
        match &self.layer_entry {
            Some((e, _)) if e.kind != EntryKind::Directory => match e.kind {
                EntryKind::Regular => NodeKind::File,
                EntryKind::Symlink => NodeKind::Symlink,
                EntryKind::Directory | EntryKind::Deleted => unreachable!(),
            },
            Some(_) => NodeKind::Dir,
            None => self.base_here.as_ref().map(|b| b.kind()).unwrap_or(NodeKind::Dir),
        }
    }

    fn size(&self) -> u64 {
        match &self.layer_entry {
            Some((e, _)) => e.content_size,
            None => self.base_here.as_ref().map(|b| b.size()).unwrap_or(0),
        }
    }

    fn mode(&self) -> u32 {
        match &self.layer_entry {
            Some((e, _)) => e.mode,
            None => self.base_here.as_ref().map(|b| b.mode()).unwrap_or(0o755),
        }
    }

    fn mtime(&self) -> u64 {
        match &self.layer_entry {
            Some((e, _)) => e.mtime_sec.max(0) as u64,
            None => self.base_here.as_ref().map(|b| b.mtime()).unwrap_or(0),
        }
    }

    fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        match &self.layer_entry {
            Some((e, contents)) if e.kind == EntryKind::Regular => {
                let start = (e.content_offset + offset).min(e.content_offset + e.content_size) as usize;
                let end = (e.content_offset + e.content_size).min((e.content_offset + offset).saturating_add(len as u64)) as usize;
                contents.get(start..end.max(start)).unwrap_or(&[]).to_vec()
            }
            _ => self.base_here.as_ref().map(|b| b.read(offset, len)).unwrap_or_default(),
        }
    }

    fn readlink(&self) -> Vec<u8> {
        match &self.layer_entry {
            Some((e, _)) if e.kind == EntryKind::Symlink => e.linkname.clone().into_bytes(),
            _ => self.base_here.as_ref().map(|b| b.readlink()).unwrap_or_default(),
        }
    }

    fn lookup(&self, name: &[u8]) -> Option<Arc<dyn AbstractNode>> {
        let name = std::str::from_utf8(name).ok()?;
        let child_path = self.child_path(name);

        let child_base = self.base_here.as_ref().and_then(|b| b.lookup(name.as_bytes()));

        match self.find_layer_entry(&child_path) {
            Some((entry, _)) if entry.kind == EntryKind::Deleted => None,
            Some(found) => Some(Arc::new(LayeredNode {
                shared: self.shared.clone(),
                path: child_path,
                base_here: child_base,
                layer_entry: Some(found),
            })),
            None => child_base.map(|base| {
                Arc::new(LayeredNode {
                    shared: self.shared.clone(),
                    path: child_path,
                    base_here: Some(base),
                    layer_entry: None,
                }) as Arc<dyn AbstractNode>
            }),
        }
    }

    fn readdir(&self) -> Vec<(Vec<u8>, Arc<dyn AbstractNode>)> {
        let mut names: BTreeSet<String> = BTreeSet::new();

        if let Some(base) = &self.base_here {
            for (name, _) in base.readdir() {
                if let Ok(s) = String::from_utf8(name) {
                    names.insert(s);
                }
            }
        }

        for layer in &self.shared.layers {
            for entry in layer.entries.values() {
                let Some(name) = direct_child_name(&self.path, &entry.path) else {
                    continue;
                };
                if entry.kind == EntryKind::Deleted {
                    names.remove(&name);
                } else {
                    names.insert(name);
                }
            }
        }

        names
            .into_iter()
            .filter_map(|name| self.lookup(name.as_bytes()).map(|node| (name.into_bytes(), node)))
            .collect()
    }
}

fn direct_child_name(prefix: &str, full_path: &str) -> Option<String> {
    let rest = if prefix.is_empty() {
        full_path
    } else {
        full_path.strip_prefix(prefix)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest.to_string())
    }
}
