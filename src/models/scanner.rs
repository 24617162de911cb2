use crate::models::identifier::normalize;
use crate::models::roots::StorageRoot;
use crate::models::validator::{is_complete, is_package_path};
use std::collections::btree_map::{BTreeMap, Entry};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Default depth of the walk beneath each storage root
pub const DEFAULT_SCAN_DEPTH: usize = 4;

/// A model found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedArtifact {
    pub id: String,
    pub directory: PathBuf,
    pub size_bytes: u64,
}

/// Canonical id → representative directory, rebuilt wholesale by every scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadedArtifactIndex {
    entries: BTreeMap<String, IndexedArtifact>,
}

impl DownloadedArtifactIndex {
    /// Look up by raw or canonical id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&IndexedArtifact> {
        self.entries.get(&normalize(id))
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Artifacts ordered by canonical id
    pub fn iter(&self) -> impl Iterator<Item = &IndexedArtifact> {
        self.entries.values()
    }

    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.entries.values().map(|a| a.size_bytes).sum()
    }
}

/// Finds complete model directories beneath storage roots
#[derive(Debug, Clone, Copy)]
pub struct ArtifactScanner {
    max_depth: usize,
}

impl Default for ArtifactScanner {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_DEPTH)
    }
}

impl ArtifactScanner {
    #[must_use]
    pub const fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Build the index of complete models across `roots`.
    ///
    /// When several directories share a canonical id, the first one found is
    /// kept unless a later one is named exactly after the canonical id.
    #[must_use]
    pub fn scan(&self, roots: &[StorageRoot]) -> DownloadedArtifactIndex {
        let mut chosen: BTreeMap<String, PathBuf> = BTreeMap::new();

        for root in roots {
            if !root.path.is_dir() {
                tracing::debug!(path = %root.path.display(), "Storage root absent, skipping");
                continue;
            }
            for candidate in self.candidates(root, true) {
                register(&mut chosen, candidate);
            }
        }

        let entries = chosen
            .into_iter()
            .map(|(id, directory)| {
                let size_bytes = directory_size(&directory);
                tracing::debug!(
                    id = %id,
                    path = %directory.display(),
                    size_bytes,
                    "Indexed model"
                );
                (
                    id.clone(),
                    IndexedArtifact {
                        id,
                        directory,
                        size_bytes,
                    },
                )
            })
            .collect();

        DownloadedArtifactIndex { entries }
    }

    /// Every directory, complete or not, whose name normalizes to `id`
    #[must_use]
    pub fn find_all(&self, roots: &[StorageRoot], id: &str) -> Vec<PathBuf> {
        let id = normalize(id);
        let mut found: Vec<PathBuf> = Vec::new();

        for root in roots.iter().filter(|r| r.path.is_dir()) {
            for candidate in self.candidates(root, false) {
                let matches = dir_name(&candidate).is_some_and(|name| normalize(name) == id);
                if matches && !found.contains(&candidate) {
                    found.push(candidate);
                }
            }
        }

        found
    }

    /// Model-named directories under one root; the root itself counts too
    fn candidates(&self, root: &StorageRoot, require_complete: bool) -> Vec<PathBuf> {
        let accept = |path: &Path| !require_complete || is_complete(path);
        let mut found = Vec::new();

        if dir_name(&root.path).is_some_and(|name| root.is_model_name(name)) && accept(&root.path)
        {
            found.push(root.path.clone());
        }

        let mut walker = WalkDir::new(&root.path)
            .min_depth(1)
            .max_depth(self.max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || (!is_hidden(entry) && !is_package_path(entry.path()))
            });

        loop {
            let entry = match walker.next() {
                None => break,
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    tracing::debug!("Skipping unreadable entry: {e}");
                    continue;
                }
            };

            if !entry.file_type().is_dir() {
                continue;
            }
            let is_model = entry
                .file_name()
                .to_str()
                .is_some_and(|name| root.is_model_name(name));

            if is_model && accept(entry.path()) {
                found.push(entry.path().to_path_buf());
                walker.skip_current_dir();
            }
        }

        found
    }
}

/// Total on-disk size of the regular files under `directory`.
///
/// Uses allocated blocks where the platform reports them, logical length
/// otherwise. Entries that cannot be read are skipped.
#[must_use]
pub fn directory_size(directory: &Path) -> u64 {
    WalkDir::new(directory)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("Skipping entry during size scan: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| allocated_size(&metadata))
        .sum()
}

#[cfg(unix)]
fn allocated_size(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;

    match metadata.blocks() {
        0 => metadata.len(),
        blocks => blocks * 512,
    }
}

#[cfg(not(unix))]
fn allocated_size(metadata: &std::fs::Metadata) -> u64 {
    metadata.len()
}

fn register(chosen: &mut BTreeMap<String, PathBuf>, candidate: PathBuf) {
    let Some(name) = dir_name(&candidate).map(str::to_string) else {
        return;
    };
    let id = normalize(&name);

    match chosen.entry(id) {
        Entry::Vacant(slot) => {
            slot.insert(candidate);
        }
        Entry::Occupied(mut slot) => {
            let existing_is_canonical = dir_name(slot.get()) == Some(slot.key().as_str());
            if name == *slot.key() && !existing_is_canonical {
                tracing::debug!(
                    id = %slot.key(),
                    replaced = %slot.get().display(),
                    with = %candidate.display(),
                    "Preferring canonically named directory"
                );
                slot.insert(candidate);
            }
        }
    }
}

fn dir_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}
