//! Tile discovery: turning a directory tree into pipeline group inputs.
//!
//! Tiles live in the leaf directories of the input tree, one directory per
//! region, with every region carrying the same set of raster files
//! distinguished by filename suffix. Each suffix becomes one output group;
//! the first leaf directory doubles as the sample used to infer raster
//! properties. Directories are visited in sorted order so the merge chain
//! order, and with it the mosaic itself, is reproducible across runs.

use geomosaic::pipeline::GroupInput;
use glob::Pattern;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("Cannot read directory {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid suffix pattern '{suffix}': {source}")]
    BadSuffix {
        suffix: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Expected to find {suffix} in {dir} but not found")]
    MissingTile { suffix: String, dir: PathBuf },
}

/// Builds one [`GroupInput`] per suffix from the leaf directories of
/// `input_dir`.
///
/// Every leaf directory must contain a file matching every suffix; a hole
/// in the matrix fails discovery rather than producing a silently
/// incomplete mosaic. When a directory holds several matches for one
/// suffix, the lexicographically first is taken.
pub fn discover_groups(
    input_dir: &Path,
    suffixes: &[String],
) -> Result<Vec<GroupInput>, DiscoverError> {
    let leaf_dirs = leaf_directories(input_dir)?;
    let mut groups = Vec::with_capacity(suffixes.len());
    for suffix in suffixes {
        let pattern =
            Pattern::new(&format!("*{suffix}")).map_err(|source| DiscoverError::BadSuffix {
                suffix: suffix.clone(),
                source,
            })?;
        let mut tile_paths = Vec::with_capacity(leaf_dirs.len());
        for dir in &leaf_dirs {
            let tile = first_match(dir, &pattern)?.ok_or_else(|| DiscoverError::MissingTile {
                suffix: suffix.clone(),
                dir: dir.clone(),
            })?;
            tile_paths.push(tile);
        }
        groups.push(GroupInput {
            key: suffix.clone(),
            sample_path: tile_paths[0].clone(),
            tile_paths,
        });
    }
    Ok(groups)
}

/// Directories under `root` (root included) that contain no
/// subdirectories, in sorted order.
fn leaf_directories(root: &Path) -> Result<Vec<PathBuf>, DiscoverError> {
    let mut leaves = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut subdirs = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|source| DiscoverError::Walk {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| DiscoverError::Walk {
                path: dir.clone(),
                source,
            })?;
            if entry.path().is_dir() {
                subdirs.push(entry.path());
            }
        }
        if subdirs.is_empty() {
            leaves.push(dir);
        } else {
            stack.extend(subdirs);
        }
    }
    leaves.sort();
    Ok(leaves)
}

/// Lexicographically first file in `dir` whose name matches `pattern`.
fn first_match(dir: &Path, pattern: &Pattern) -> Result<Option<PathBuf>, DiscoverError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DiscoverError::Walk {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .is_some_and(|name| pattern.matches(&name.to_string_lossy()))
        })
        .collect();
    matches.sort();
    Ok(matches.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_groups_tiles_by_suffix_across_leaf_directories() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("region_b/n_export.ras"));
        touch(&dir.path().join("region_b/modified_load.ras"));
        touch(&dir.path().join("region_a/n_export.ras"));
        touch(&dir.path().join("region_a/modified_load.ras"));

        let groups = discover_groups(
            dir.path(),
            &["n_export.ras".into(), "modified_load.ras".into()],
        )
        .unwrap();

        assert_eq!(groups.len(), 2);
        let export = &groups[0];
        assert_eq!(export.key, "n_export.ras");
        assert_eq!(export.tile_paths.len(), 2);
        // Sorted directory order fixes the chain order.
        assert_eq!(
            export.tile_paths[0],
            dir.path().join("region_a/n_export.ras")
        );
        assert_eq!(export.sample_path, export.tile_paths[0]);
    }

    #[test]
    fn test_only_leaf_directories_are_scanned() {
        let dir = TempDir::new().unwrap();
        // A decoy at an inner level must not be picked up.
        touch(&dir.path().join("export.ras"));
        std::fs::create_dir_all(dir.path().join("inner/leaf")).unwrap();
        touch(&dir.path().join("inner/leaf/export.ras"));

        let groups = discover_groups(dir.path(), &["export.ras".into()]).unwrap();
        assert_eq!(groups[0].tile_paths.len(), 1);
        assert_eq!(
            groups[0].tile_paths[0],
            dir.path().join("inner/leaf/export.ras")
        );
    }

    #[test]
    fn test_missing_suffix_in_one_directory_fails() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("region_a/export.ras"));
        touch(&dir.path().join("region_b/unrelated.ras"));

        let err = discover_groups(dir.path(), &["export.ras".into()]).unwrap_err();
        match err {
            DiscoverError::MissingTile { suffix, dir: d } => {
                assert_eq!(suffix, "export.ras");
                assert!(d.ends_with("region_b"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_tree_fails() {
        let dir = TempDir::new().unwrap();
        // The bare root is itself a leaf with no tiles.
        let err = discover_groups(dir.path(), &["export.ras".into()]).unwrap_err();
        assert!(matches!(err, DiscoverError::MissingTile { .. }));
    }

    #[test]
    fn test_multiple_matches_take_lexicographic_first() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("region_a/b_export.ras"));
        touch(&dir.path().join("region_a/a_export.ras"));

        let groups = discover_groups(dir.path(), &["export.ras".into()]).unwrap();
        assert_eq!(
            groups[0].tile_paths[0],
            dir.path().join("region_a/a_export.ras")
        );
    }
}
