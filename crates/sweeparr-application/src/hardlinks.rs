// SPDX-License-Identifier: GPL-3.0-or-later
//! Hardlink counting used to find downloads no longer imported anywhere.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(unix)]
use tracing::warn;
use tracing::debug;

use crate::download_clients::{FileSelection, TorrentFile};

pub trait HardLinkFileService: Send + Sync {
    /// Number of hardlinks to `path`, or a negative value when the file is missing.
    ///
    /// With `ignore_root_dirs`, links that live inside the directories passed to
    /// [`populate_file_counts`](Self::populate_file_counts) are not counted,
    /// apart from `path` itself.
    fn get_hard_link_count(&self, path: &Path, ignore_root_dirs: bool) -> i64;

    /// Index every file below `dirs`. Replaces any previous index.
    fn populate_file_counts(&self, dirs: &[PathBuf]);
}

#[derive(Default)]
struct LinkIndex {
    roots: Vec<PathBuf>,
    // (device, inode) -> occurrences below the roots
    occurrences: HashMap<(u64, u64), i64>,
}

/// Filesystem implementation backed by inode metadata.
#[derive(Default)]
pub struct FsHardLinkFileService {
    index: Mutex<LinkIndex>,
}

impl FsHardLinkFileService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(unix)]
impl HardLinkFileService for FsHardLinkFileService {
    fn get_hard_link_count(&self, path: &Path, ignore_root_dirs: bool) -> i64 {
        use std::os::unix::fs::MetadataExt;

        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(target: "hardlinks", path = %path.display(), error = %err, "file not found");
                return -1;
            }
        };

        let links = metadata.nlink() as i64;
        if !ignore_root_dirs {
            return links;
        }

        let index = self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ignored = index
            .occurrences
            .get(&(metadata.dev(), metadata.ino()))
            .copied()
            .unwrap_or(0);
        if ignored > 0 && index.roots.iter().any(|root| path.starts_with(root)) {
            ignored -= 1;
        }

        (links - ignored).max(0)
    }

    fn populate_file_counts(&self, dirs: &[PathBuf]) {
        use std::os::unix::fs::MetadataExt;
        use walkdir::WalkDir;

        let mut occurrences = HashMap::new();
        for dir in dirs {
            for entry in WalkDir::new(dir).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(target: "hardlinks", dir = %dir.display(), error = %err, "failed to traverse directory");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if metadata.nlink() > 1 {
                    *occurrences
                        .entry((metadata.dev(), metadata.ino()))
                        .or_insert(0) += 1;
                }
            }
        }

        debug!(target: "hardlinks", dirs = dirs.len(), linked_inodes = occurrences.len(), "file counts populated");

        let mut index = self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        index.roots = dirs.to_vec();
        index.occurrences = occurrences;
    }
}

#[cfg(not(unix))]
impl HardLinkFileService for FsHardLinkFileService {
    fn get_hard_link_count(&self, path: &Path, _ignore_root_dirs: bool) -> i64 {
        debug!(target: "hardlinks", path = %path.display(), "hardlink counts unavailable on this platform");
        -1
    }

    fn populate_file_counts(&self, dirs: &[PathBuf]) {
        let mut index = self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        index.roots = dirs.to_vec();
        index.occurrences.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCheck {
    /// Every wanted file has at most one link.
    Orphaned,
    Linked { path: PathBuf },
    Missing { path: PathBuf },
    NoFiles,
}

/// Classify a download by the link counts of its wanted files.
pub fn check_hard_links(
    service: &dyn HardLinkFileService,
    save_path: &str,
    files: &[TorrentFile],
    ignore_root_dirs: bool,
) -> LinkCheck {
    let mut checked = 0usize;

    for file in files
        .iter()
        .filter(|file| file.selection == FileSelection::Wanted)
    {
        let path = Path::new(save_path).join(&file.path);
        let count = service.get_hard_link_count(&path, ignore_root_dirs);
        if count < 0 {
            return LinkCheck::Missing { path };
        }
        if count > 1 {
            return LinkCheck::Linked { path };
        }
        checked += 1;
    }

    if checked == 0 {
        LinkCheck::NoFiles
    } else {
        LinkCheck::Orphaned
    }
}
