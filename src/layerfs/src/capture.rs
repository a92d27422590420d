//! `CaptureLayer`: turns a walk of a live overlay's materialized nodes (see
//! `devices::virtio::fs::cow::CowFs::capture`) into a layer's entries and
//! content blob.

use devices::virtio::fs::{NodeKind, WalkEntry};
use glob::Pattern;

use crate::entry::{EntryKind, LayerEntry};

/// Exclude patterns, matched against the full path, the basename, or as a
/// directory-prefix match (`pattern + "/"`).
pub struct Excludes {
    patterns: Vec<Pattern>,
}

impl Excludes {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Excludes {
            patterns: patterns.into_iter().filter_map(|p| Pattern::new(&p).ok()).collect(),
        }
    }

    pub fn empty() -> Self {
        Excludes { patterns: Vec::new() }
    }

    fn matches(&self, path: &str) -> bool {
        let basename = path.rsplit('/').next().unwrap_or(path);
        self.patterns.iter().any(|p| {
            p.matches(path) || p.matches(basename) || path.starts_with(&format!("{}/", p.as_str()))
        })
    }
}

/// Builds a layer's entries and content blob from a node-graph walk,
/// skipping excluded paths and deduplicating by path (first occurrence
/// wins, matching hardlink-correct capture semantics).
pub fn capture_layer(walk: Vec<WalkEntry>, excludes: &Excludes) -> (Vec<LayerEntry>, Vec<u8>) {
    let mut entries = Vec::new();
    let mut contents = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for w in walk {
        let path = String::from_utf8_lossy(&w.path).into_owned();
        if excludes.matches(&path) {
            continue;
        }
        if !seen.insert(path.clone()) {
            continue;
        }

        let kind = if w.deleted {
            EntryKind::Deleted
        } else {
            match w.kind {
                NodeKind::File => EntryKind::Regular,
                NodeKind::Dir => EntryKind::Directory,
                NodeKind::Symlink => EntryKind::Symlink,
            }
        };

        let (content_offset, content_size) = if kind == EntryKind::Regular {
            let offset = contents.len() as u64;
            contents.extend_from_slice(&w.content);
            (offset, w.content.len() as u64)
        } else {
            (0, 0)
        };

        let linkname = if kind == EntryKind::Symlink {
            String::from_utf8_lossy(&w.linkname).into_owned()
        } else {
            String::new()
        };

        entries.push(LayerEntry {
            path,
            kind,
            mode: w.mode,
            uid: w.uid,
            gid: w.gid,
            mtime_sec: w.mtime as i64,
            mtime_nsec: 0,
            content_offset,
            content_size,
            linkname,
        });
    }

    (entries, contents)
}
