use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::DiscoveryError;

/// Resolve a manifest path into the sorted list of `*.lua` files it names.
///
/// A file path must itself be a `.lua` manifest. A directory is searched
/// recursively.
///
/// # Errors
///
/// Returns an error if `path` does not exist, names a non-Lua file, directory
/// walking fails, or a manifest path cannot be canonicalized.
pub fn discover_manifests(path: &Path) -> std::result::Result<Vec<PathBuf>, DiscoveryError> {
    if !path.exists() {
        return Err(DiscoveryError::PathDoesNotExist {
            path: path.to_path_buf(),
        });
    }

    if path.is_file() {
        if !is_lua(path) {
            return Err(DiscoveryError::NotAManifest {
                path: path.to_path_buf(),
            });
        }
        return Ok(vec![canonicalize(path)?]);
    }

    let mut manifests = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|source| DiscoveryError::Walk { source })?;
        if !entry.file_type().is_file() || !is_lua(entry.path()) {
            continue;
        }
        manifests.push(canonicalize(entry.path())?);
    }

    manifests.sort();
    Ok(manifests)
}

/// Directory that anchors relative paths (state file, config) for `path`.
#[must_use]
pub fn manifest_root(path: &Path) -> PathBuf {
    let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if absolute.is_file() {
        absolute
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    } else {
        absolute
    }
}

fn is_lua(path: &Path) -> bool {
    path.extension().is_some_and(|extension| extension == "lua")
}

fn canonicalize(path: &Path) -> std::result::Result<PathBuf, DiscoveryError> {
    fs::canonicalize(path).map_err(|source| DiscoveryError::CanonicalizePath {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::fs;

    use super::{discover_manifests, manifest_root};
    use crate::error::DiscoveryError;

    #[test]
    fn finds_only_lua_manifests_in_sorted_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("a")).expect("mkdir");
        fs::create_dir_all(root.join("z/nested")).expect("mkdir");
        fs::write(root.join("z/nested/two.lua"), "").expect("write");
        fs::write(root.join("a/one.lua"), "").expect("write");
        fs::write(root.join("a/ignore.txt"), "").expect("write");

        let manifests = discover_manifests(root).expect("discover");
        assert_eq!(manifests.len(), 2);
        assert!(manifests[0].ends_with("a/one.lua"));
        assert!(manifests[1].ends_with("z/nested/two.lua"));
    }

    #[test]
    fn accepts_a_single_manifest_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("stack.lua");
        fs::write(&file, "").expect("write");

        let manifests = discover_manifests(&file).expect("discover");
        assert_eq!(manifests.len(), 1);
        assert!(manifests[0].ends_with("stack.lua"));
        assert_eq!(
            manifest_root(&file),
            fs::canonicalize(temp.path()).expect("canonical")
        );
    }

    #[test]
    fn rejects_missing_and_non_lua_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = discover_manifests(&temp.path().join("nope")).expect_err("missing");
        assert!(matches!(missing, DiscoveryError::PathDoesNotExist { .. }));

        let text = temp.path().join("notes.txt");
        fs::write(&text, "").expect("write");
        let wrong = discover_manifests(&text).expect_err("not lua");
        assert!(matches!(wrong, DiscoveryError::NotAManifest { .. }));
    }
}
