use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use crate::flash::format_offset;
use crate::image::{FilesystemKind, ImageCheck};

pub const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Interrupted,
}

/// A filesystem image produced during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub kind: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub expected_size_bytes: u64,
    pub sha256: String,
    pub flash_offset: String,
}

impl ImageRecord {
    pub fn new(kind: FilesystemKind, check: &ImageCheck) -> Self {
        Self {
            kind: kind.backend().to_string(),
            path: check.path.clone(),
            size_bytes: check.actual_size,
            expected_size_bytes: check.expected_size,
            sha256: check.sha256.clone(),
            flash_offset: format_offset(kind.flash_offset()),
        }
    }
}

/// What a deployment did, written to `.pio/noox-deploy/run-manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub completed_stages: Vec<String>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub images: Vec<ImageRecord>,
}

impl RunManifest {
    pub fn start() -> Self {
        Self {
            status: RunStatus::Running,
            created_at_utc: now_utc_compact(),
            finished_at_utc: None,
            completed_stages: Vec::new(),
            failed_stage: None,
            error: None,
            images: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at_utc = Some(now_utc_compact());
    }

    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join(RUN_MANIFEST_FILENAME)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
            .with_context(|| format!("writing run manifest '{}'", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub(crate) fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_write_and_load() {
        let temp = TempDir::new().unwrap();
        let path = RunManifest::path_in(&temp.path().join("state"));

        let mut manifest = RunManifest::start();
        manifest.completed_stages.push("compress".to_string());
        manifest.images.push(ImageRecord::new(
            FilesystemKind::LittleFs,
            &ImageCheck {
                path: PathBuf::from("littlefs.bin"),
                expected_size: 2_097_152,
                actual_size: 2_097_152,
                sha256: "ab".repeat(32),
            },
        ));
        manifest.finish(RunStatus::Success);
        manifest.write(&path).unwrap();

        let loaded = RunManifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.images[0].flash_offset, "0x810000");
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"status\": \"success\""));
    }

    #[test]
    fn test_now_utc_compact_shape() {
        let stamp = now_utc_compact();
        assert_eq!(stamp.len(), 16);
        assert!(stamp.ends_with('Z'));
        assert_eq!(&stamp[8..9], "T");
    }
}
