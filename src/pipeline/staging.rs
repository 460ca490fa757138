//! The staging directory packed into filesystem images.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Empty `staging` and copy the tree under `source` into it.
///
/// A missing `source` leaves `staging` empty. Returns the number of files
/// copied.
pub fn repopulate(staging: &Path, source: &Path) -> Result<usize> {
    if staging.exists() {
        fs::remove_dir_all(staging)
            .with_context(|| format!("clearing staging directory '{}'", staging.display()))?;
    }
    fs::create_dir_all(staging)
        .with_context(|| format!("creating staging directory '{}'", staging.display()))?;

    if !source.is_dir() {
        return Ok(0);
    }

    let mut copied = 0;
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", source.display()))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let dest = staging.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("creating '{}'", dest.display()))?;
        } else {
            fs::copy(entry.path(), &dest).with_context(|| {
                format!(
                    "copying '{}' to '{}'",
                    entry.path().display(),
                    dest.display()
                )
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Remove the staging directory. `false` if there was nothing to remove.
pub fn remove(staging: &Path) -> Result<bool> {
    if !staging.exists() {
        return Ok(false);
    }
    fs::remove_dir_all(staging)
        .with_context(|| format!("removing staging directory '{}'", staging.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_repopulate_replaces_previous_contents() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("data");
        let source = temp.path().join("data_littlefs");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("stale.txt"), b"old").unwrap();
        fs::create_dir_all(source.join("agents")).unwrap();
        fs::write(source.join("index.html.gz"), b"gz").unwrap();
        fs::write(source.join("agents/agent.json"), b"{}").unwrap();

        let copied = repopulate(&staging, &source).unwrap();

        assert_eq!(copied, 2);
        assert!(!staging.join("stale.txt").exists());
        assert_eq!(fs::read(staging.join("index.html.gz")).unwrap(), b"gz");
        assert!(staging.join("agents/agent.json").is_file());
    }

    #[test]
    fn test_repopulate_missing_source_leaves_empty_dir() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("data");

        let copied = repopulate(&staging, &temp.path().join("data_ffat")).unwrap();

        assert_eq!(copied, 0);
        assert!(staging.is_dir());
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_remove() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("data");
        assert!(!remove(&staging).unwrap());
        fs::create_dir_all(staging.join("nested")).unwrap();
        assert!(remove(&staging).unwrap());
        assert!(!staging.exists());
    }
}
