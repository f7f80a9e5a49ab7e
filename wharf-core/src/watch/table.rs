//! Registration tables shared by the event source and its read loop.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};

use super::WatchError;
use super::mask::{Mask, Op};

/// A registered path and the directory whose watch covers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    /// Absolute, lexically cleaned path.
    pub path: PathBuf,
    /// Containing directory.
    pub dir: PathBuf,
    /// Operations the caller asked for.
    pub op: Op,
}

#[derive(Debug, Clone, Copy)]
struct DirectoryWatch {
    wd: i32,
    mask: Mask,
}

/// What the table needs from the OS when a target is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchRequest<'a> {
    /// First target in `dir`: create a watch with `mask`.
    Create { dir: &'a Path, mask: Mask },
    /// Existing watch on `dir` must also report `mask`.
    Widen { dir: &'a Path, mask: Mask },
}

/// Directory ↔ descriptor ↔ target bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct WatchTable {
    wd_dir: HashMap<i32, PathBuf>,
    dir_wd: HashMap<PathBuf, DirectoryWatch>,
    targets: Vec<WatchTarget>,
}

impl WatchTable {
    /// Register `path`, asking `os` for a directory watch only when needed.
    pub(crate) fn register<F>(
        &mut self,
        path: &Path,
        op: Op,
        os: F,
    ) -> Result<(), WatchError>
    where
        F: FnOnce(WatchRequest<'_>) -> io::Result<i32>,
    {
        let path = canonical_target(path).map_err(|source| {
            WatchError::Resolve {
                path: path.to_path_buf(),
                source,
            }
        })?;
        if self.contains(&path) {
            return Err(WatchError::AlreadyWatched(path));
        }

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WatchError::NoParent(path.clone()))?;
        let wanted = op.to_mask();

        match self.dir_wd.get(&dir).copied() {
            Some(existing) if existing.mask.contains(wanted) => {}
            Some(existing) => {
                let mask = existing.mask | wanted;
                let wd = os(WatchRequest::Widen { dir: &dir, mask })
                    .map_err(|source| WatchError::AddWatch {
                        path: dir.clone(),
                        source,
                    })?;
                self.dir_wd.insert(dir.clone(), DirectoryWatch { wd, mask });
            }
            None => {
                let wd = os(WatchRequest::Create {
                    dir: &dir,
                    mask: wanted,
                })
                .map_err(|source| WatchError::AddWatch {
                    path: dir.clone(),
                    source,
                })?;
                self.dir_wd.insert(
                    dir.clone(),
                    DirectoryWatch { wd, mask: wanted },
                );
                self.wd_dir.insert(wd, dir.clone());
            }
        }

        self.targets.push(WatchTarget { path, dir, op });
        Ok(())
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.targets.iter().any(|target| target.path == path)
    }

    pub(crate) fn dir_for(&self, wd: i32) -> Option<&Path> {
        self.wd_dir.get(&wd).map(PathBuf::as_path)
    }

    /// Resolve an event name inside the directory watched by `wd` to a
    /// registered target.
    pub(crate) fn match_target(&self, wd: i32, name: &OsStr) -> Option<PathBuf> {
        let dir = self.dir_for(wd)?;
        if name.is_empty() {
            return None;
        }
        let candidate = dir.join(name);
        self.contains(&candidate).then_some(candidate)
    }

    /// Forget the directory behind `wd` and every target inside it.
    pub(crate) fn remove_dir(&mut self, wd: i32) -> Vec<PathBuf> {
        let Some(dir) = self.wd_dir.remove(&wd) else {
            return Vec::new();
        };
        self.dir_wd.remove(&dir);

        let mut removed = Vec::new();
        self.targets.retain(|target| {
            if target.dir == dir {
                removed.push(target.path.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Targets in registration order.
    pub(crate) fn watched(&self) -> Vec<PathBuf> {
        self.targets.iter().map(|target| target.path.clone()).collect()
    }

    pub(crate) fn directory_count(&self) -> usize {
        self.dir_wd.len()
    }

    /// Empty every table, returning the descriptors that were live.
    pub(crate) fn drain(&mut self) -> Vec<i32> {
        let wds = self.wd_dir.keys().copied().collect();
        self.wd_dir.clear();
        self.dir_wd.clear();
        self.targets.clear();
        wds
    }
}

/// Absolute, lexically cleaned form of `path`. The file itself does not have
/// to exist.
pub fn canonical_target(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other.as_os_str()),
        }
    }
    Ok(clean)
}
