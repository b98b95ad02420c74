// ABOUTME: Host-to-sandbox path binding model (volumes and devices) for container runs
// ABOUTME: Resolves nested mount destinations into a flat, conflict-free binding set

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use bollard::models::DeviceMapping;
use tracing::debug;

use crate::error::Result;

/// Rendering of a mount mode into the engine's bind-string suffix.
pub trait BindMode: Copy {
    fn as_str(self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeMode {
    ReadOnly,
    ReadWrite,
}

impl BindMode for VolumeMode {
    fn as_str(self) -> &'static str {
        match self {
            VolumeMode::ReadOnly => "ro",
            VolumeMode::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    ReadOnly,
    ReadWrite,
    ReadWriteMknod,
}

impl BindMode for DeviceMode {
    fn as_str(self) -> &'static str {
        match self {
            DeviceMode::ReadOnly => "ro",
            DeviceMode::ReadWrite => "rw",
            DeviceMode::ReadWriteMknod => "rwm",
        }
    }
}

/// Mapping from sandbox destination to `(host source, mode)`.
///
/// Destinations are unique by construction (last insert wins) and normalized
/// lexically, so conflict detection only ever compares path components.
#[derive(Debug, Clone, PartialEq)]
pub struct MountMap<M> {
    entries: BTreeMap<PathBuf, (PathBuf, M)>,
}

pub type VolumeMap = MountMap<VolumeMode>;
pub type DeviceMap = MountMap<DeviceMode>;

impl<M> Default for MountMap<M> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<M> MountMap<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, destination: impl AsRef<Path>, source: impl Into<PathBuf>, mode: M) {
        self.entries
            .insert(normalize(destination.as_ref()), (source.into(), mode));
    }

    pub fn get(&self, destination: impl AsRef<Path>) -> Option<&(PathBuf, M)> {
        self.entries.get(&normalize(destination.as_ref()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Path, &M)> {
        self.entries
            .iter()
            .map(|(destination, (source, mode))| (destination.as_path(), source.as_path(), mode))
    }

    /// Destinations that have another destination mounted beneath them.
    ///
    /// For each entry only the nearest conflicting ancestor is reported;
    /// farther ancestors surface on later passes of [`resolve_overlaps`].
    ///
    /// [`resolve_overlaps`]: MountMap::resolve_overlaps
    fn conflicting_ancestors(&self) -> BTreeSet<PathBuf> {
        let mut conflicts = BTreeSet::new();
        for destination in self.entries.keys() {
            for ancestor in destination.ancestors().skip(1) {
                if self.entries.contains_key(ancestor) {
                    conflicts.insert(ancestor.to_path_buf());
                    break;
                }
            }
        }
        conflicts
    }
}

impl<M: Copy> MountMap<M> {
    /// Flatten nested mount destinations until no destination is a proper
    /// path ancestor of another.
    ///
    /// A conflicting ancestor mount is replaced by one mount per direct child
    /// of its host source, at the corresponding child destination. Explicit
    /// entries already present at a child destination take precedence over
    /// the synthesized ones. Synthesized entries are one path segment more
    /// specific than their parent, so the fixpoint is reached once every
    /// conflict has been pushed below the deepest explicit entry.
    pub fn resolve_overlaps(mut self) -> Result<Self> {
        loop {
            let conflicts = self.conflicting_ancestors();
            if conflicts.is_empty() {
                return Ok(self);
            }
            for destination in conflicts {
                let Some((source, mode)) = self.entries.remove(&destination) else {
                    continue;
                };
                debug!(
                    "splitting mount of `{}` at `{}` around nested mounts",
                    source.display(),
                    destination.display()
                );
                for entry in fs::read_dir(&source)? {
                    let child = entry?.path();
                    let Some(name) = child.file_name() else {
                        continue;
                    };
                    self.entries
                        .entry(destination.join(name))
                        .or_insert((child, mode));
                }
            }
        }
    }
}

impl<M: BindMode> MountMap<M> {
    /// Engine-facing bind strings, `host:destination:mode`.
    ///
    /// Sources are canonicalized; entries whose host path does not exist are
    /// dropped silently (optional mounts degrade to "not present").
    pub fn bindings(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|(destination, (source, mode))| match source.canonicalize() {
                Ok(host) => Some(format!(
                    "{}:{}:{}",
                    host.display(),
                    destination.display(),
                    mode.as_str()
                )),
                Err(_) => {
                    debug!("skipping mount of missing `{}`", source.display());
                    None
                }
            })
            .collect()
    }
}

impl DeviceMap {
    /// Device passthrough entries in the engine's representation.
    pub fn device_mappings(&self) -> Vec<DeviceMapping> {
        self.entries
            .iter()
            .filter_map(|(destination, (source, mode))| {
                let host = source.canonicalize().ok()?;
                Some(DeviceMapping {
                    path_on_host: Some(host.display().to_string()),
                    path_in_container: Some(destination.display().to_string()),
                    cgroup_permissions: Some(mode.as_str().to_string()),
                })
            })
            .collect()
    }
}

/// Lexical normalization: drops `.` components and folds `..` onto the parent.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    fn has_nested_destinations<M>(map: &MountMap<M>) -> bool {
        map.entries.keys().any(|destination| {
            destination
                .ancestors()
                .skip(1)
                .any(|ancestor| map.entries.contains_key(ancestor))
        })
    }

    #[test]
    fn destinations_are_normalized_on_insert() {
        let mut volumes = VolumeMap::new();
        volumes.insert("/a/./b/../c", "/host", VolumeMode::ReadOnly);
        assert!(volumes.get("/a/c").is_some());
    }

    #[test]
    fn last_insert_wins_per_destination() {
        let mut volumes = VolumeMap::new();
        volumes.insert("/a", "/host/one", VolumeMode::ReadOnly);
        volumes.insert("/a", "/host/two", VolumeMode::ReadWrite);
        assert_eq!(volumes.len(), 1);
        assert_eq!(
            volumes.get("/a"),
            Some(&(PathBuf::from("/host/two"), VolumeMode::ReadWrite))
        );
    }

    #[test]
    fn overlap_resolution_splits_ancestor_around_explicit_child() {
        let host = TempDir::new().unwrap();
        let tree = host.path().join("a");
        fs::create_dir(&tree).unwrap();
        touch(&tree.join("b"));
        touch(&tree.join("c"));

        let mut volumes = VolumeMap::new();
        volumes.insert("/a", &tree, VolumeMode::ReadOnly);
        volumes.insert("/a/b", host.path().join("a/b"), VolumeMode::ReadWrite);

        let resolved = volumes.resolve_overlaps().unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved.get("/a/b"),
            Some(&(host.path().join("a/b"), VolumeMode::ReadWrite))
        );
        assert_eq!(
            resolved.get("/a/c"),
            Some(&(tree.join("c"), VolumeMode::ReadOnly))
        );
        assert!(!has_nested_destinations(&resolved));
    }

    #[test]
    fn overlap_resolution_handles_deeply_nested_entries() {
        let host = TempDir::new().unwrap();
        fs::create_dir_all(host.path().join("a/b")).unwrap();
        touch(&host.path().join("a/b/c"));
        touch(&host.path().join("a/b/d"));
        touch(&host.path().join("a/e"));
        touch(&host.path().join("x"));

        let mut volumes = VolumeMap::new();
        volumes.insert("/m", host.path().join("a"), VolumeMode::ReadOnly);
        volumes.insert("/m/b/c", host.path().join("x"), VolumeMode::ReadWrite);

        // First pass splits `/m`; the synthesized `/m/b` then conflicts with
        // `/m/b/c` and is split in turn.
        let resolved = volumes.resolve_overlaps().unwrap();
        assert!(!has_nested_destinations(&resolved));
        assert_eq!(
            resolved.get("/m/b/c"),
            Some(&(host.path().join("x"), VolumeMode::ReadWrite))
        );
        assert_eq!(
            resolved.get("/m/b/d"),
            Some(&(host.path().join("a/b/d"), VolumeMode::ReadOnly))
        );
        assert_eq!(
            resolved.get("/m/e"),
            Some(&(host.path().join("a/e"), VolumeMode::ReadOnly))
        );
    }

    #[test]
    fn overlap_resolution_is_idempotent() {
        let host = TempDir::new().unwrap();
        fs::create_dir(host.path().join("a")).unwrap();
        touch(&host.path().join("a/b"));
        touch(&host.path().join("a/c"));

        let mut volumes = VolumeMap::new();
        volumes.insert("/a", host.path().join("a"), VolumeMode::ReadOnly);
        volumes.insert("/a/b", host.path().join("a/b"), VolumeMode::ReadWrite);

        let once = volumes.resolve_overlaps().unwrap();
        let twice = once.clone().resolve_overlaps().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn overlap_resolution_preserves_reachability() {
        let host = TempDir::new().unwrap();
        fs::create_dir(host.path().join("a")).unwrap();
        touch(&host.path().join("a/b"));
        touch(&host.path().join("a/c"));
        touch(&host.path().join("a/d"));

        let mut volumes = VolumeMap::new();
        volumes.insert("/a", host.path().join("a"), VolumeMode::ReadOnly);
        volumes.insert("/a/b", host.path().join("a/b"), VolumeMode::ReadWrite);

        let resolved = volumes.resolve_overlaps().unwrap();
        // Every file visible through the original map is still visible at the
        // same sandbox path.
        for name in ["b", "c", "d"] {
            let (source, _) = resolved.get(format!("/a/{name}")).unwrap();
            assert_eq!(source, &host.path().join("a").join(name));
        }
    }

    #[test]
    fn non_overlapping_map_is_untouched() {
        let mut volumes = VolumeMap::new();
        volumes.insert("/a", "/host/a", VolumeMode::ReadOnly);
        volumes.insert("/b", "/host/b", VolumeMode::ReadWrite);

        let resolved = volumes.clone().resolve_overlaps().unwrap();
        assert_eq!(resolved, volumes);
    }

    #[test]
    fn bindings_skip_missing_sources() {
        let host = TempDir::new().unwrap();
        fs::create_dir(host.path().join("present")).unwrap();

        let mut volumes = VolumeMap::new();
        volumes.insert("/present", host.path().join("present"), VolumeMode::ReadOnly);
        volumes.insert("/absent", host.path().join("absent"), VolumeMode::ReadWrite);

        let bindings = volumes.bindings();
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].ends_with(":/present:ro"));
    }

    #[test]
    fn bindings_render_modes() {
        let host = TempDir::new().unwrap();

        let mut volumes = VolumeMap::new();
        volumes.insert("/rw", host.path(), VolumeMode::ReadWrite);
        assert!(volumes.bindings()[0].ends_with(":rw"));

        let mut devices = DeviceMap::new();
        devices.insert("/dev/thing", host.path(), DeviceMode::ReadWriteMknod);
        let mappings = devices.device_mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].cgroup_permissions.as_deref(), Some("rwm"));
        assert_eq!(mappings[0].path_in_container.as_deref(), Some("/dev/thing"));
    }
}
