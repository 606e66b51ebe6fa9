//! Volume set diff between the local tree and its remote copy.

use std::collections::HashSet;

/// Maps local volume names onto the remote tree by root prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub local_root: String,
    pub remote_root: String,
}

impl PathMapping {
    pub fn new(local_root: impl Into<String>, remote_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into(),
        }
    }

    /// Remote name of a local volume. Names outside the local root map to
    /// themselves.
    pub fn to_remote(&self, local: &str) -> String {
        match local.strip_prefix(&self.local_root) {
            Some(rest) => format!("{}{}", self.remote_root, rest),
            None => local.to_string(),
        }
    }
}

/// Partition of the local inventory, computed once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSetDiff {
    /// Missing remotely, sorted lexicographically
    pub needs_full: Vec<String>,
    /// Present remotely, in inventory order
    pub needs_incremental: Vec<String>,
    /// Missing remotely but matching an ignore prefix
    pub ignored: Vec<String>,
}

impl VolumeSetDiff {
    pub fn compute(
        local: &[String],
        remote: &[String],
        ignore_prefixes: &[String],
        mapping: &PathMapping,
    ) -> Self {
        let remote: HashSet<&str> = remote.iter().map(String::as_str).collect();
        let mut diff = VolumeSetDiff::default();

        for volume in local.iter().filter(|v| !v.trim().is_empty()) {
            let remote_name = mapping.to_remote(volume);
            if remote.contains(remote_name.as_str()) {
                diff.needs_incremental.push(volume.clone());
            } else if is_ignored(volume, ignore_prefixes) {
                diff.ignored.push(volume.clone());
            } else {
                diff.needs_full.push(volume.clone());
            }
        }

        diff.needs_full.sort();
        diff
    }

    pub fn total(&self) -> usize {
        self.needs_full.len() + self.needs_incremental.len() + self.ignored.len()
    }
}

fn is_ignored(volume: &str, ignore_prefixes: &[String]) -> bool {
    ignore_prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && volume.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn same_root() -> PathMapping {
        PathMapping::new("tank", "tank")
    }

    #[test]
    fn test_everything_missing_goes_full_sorted() {
        let diff = VolumeSetDiff::compute(&names(&["tank/b", "tank/a"]), &[], &[], &same_root());
        assert_eq!(diff.needs_full, names(&["tank/a", "tank/b"]));
        assert!(diff.needs_incremental.is_empty());
        assert!(diff.ignored.is_empty());
    }

    #[test]
    fn test_present_volumes_go_incremental_in_inventory_order() {
        let local = names(&["tank/z", "tank/a", "tank/new"]);
        let remote = names(&["tank/a", "tank/z"]);
        let diff = VolumeSetDiff::compute(&local, &remote, &[], &same_root());
        assert_eq!(diff.needs_incremental, names(&["tank/z", "tank/a"]));
        assert_eq!(diff.needs_full, names(&["tank/new"]));
    }

    #[test]
    fn test_ignored_missing_volume_dropped_from_both_sets() {
        let local = names(&["tank/scratch/tmp1", "tank/a"]);
        let diff = VolumeSetDiff::compute(&local, &[], &names(&["tank/scratch"]), &same_root());
        assert_eq!(diff.needs_full, names(&["tank/a"]));
        assert!(diff.needs_incremental.is_empty());
        assert_eq!(diff.ignored, names(&["tank/scratch/tmp1"]));
    }

    #[test]
    fn test_ignore_prefix_does_not_affect_present_volumes() {
        let local = names(&["tank/scratch"]);
        let remote = names(&["tank/scratch"]);
        let diff = VolumeSetDiff::compute(&local, &remote, &names(&["tank/scratch"]), &same_root());
        assert_eq!(diff.needs_incremental, names(&["tank/scratch"]));
        assert!(diff.ignored.is_empty());
    }

    #[test]
    fn test_empty_ignore_prefix_never_matches() {
        let diff = VolumeSetDiff::compute(&names(&["tank/a"]), &[], &names(&[""]), &same_root());
        assert_eq!(diff.needs_full, names(&["tank/a"]));
    }

    #[test]
    fn test_prefix_mapping_between_roots() {
        let mapping = PathMapping::new("tank/data", "backup/host1");
        assert_eq!(mapping.to_remote("tank/data/www"), "backup/host1/www");
        assert_eq!(mapping.to_remote("tank/data"), "backup/host1");
        assert_eq!(mapping.to_remote("other/x"), "other/x");

        let local = names(&["tank/data", "tank/data/www", "tank/data/db"]);
        let remote = names(&["backup/host1", "backup/host1/www"]);
        let diff = VolumeSetDiff::compute(&local, &remote, &[], &mapping);
        assert_eq!(diff.needs_incremental, names(&["tank/data", "tank/data/www"]));
        assert_eq!(diff.needs_full, names(&["tank/data/db"]));
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let local = names(&["tank/a", "tank/b", "tank/tmp/x", "tank/c", "tank/tmp/y"]);
        let remote = names(&["tank/b", "tank/tmp/y"]);
        let ignore = names(&["tank/tmp"]);
        let diff = VolumeSetDiff::compute(&local, &remote, &ignore, &same_root());

        assert_eq!(diff.total(), local.len());
        let mut all: Vec<String> = diff
            .needs_full
            .iter()
            .chain(&diff.needs_incremental)
            .chain(&diff.ignored)
            .cloned()
            .collect();
        all.sort();
        let mut expected = local.clone();
        expected.sort();
        assert_eq!(all, expected);

        for volume in &diff.needs_full {
            assert!(!remote.contains(volume));
            assert!(!volume.starts_with("tank/tmp"));
        }
    }
}
