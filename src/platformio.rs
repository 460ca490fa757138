//! Editing `platformio.ini` for the filesystem stages.
//!
//! PlatformIO picks the filesystem driver from `board_build.filesystem`. The
//! deployment flips it between `littlefs` and `fatfs`, so the original file is
//! snapshotted to a `.backup` sibling first and put back afterwards.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DeployConfig;
use crate::process::Cmd;

/// Key selecting the filesystem backend.
pub const FILESYSTEM_KEY: &str = "board_build.filesystem";

const BACKUP_SUFFIX: &str = ".backup";

/// `pio run -e <env> [--target <target>]` in the project root.
///
/// The env is always named so the build, the upload and `buildfs` all land in
/// `.pio/build/<env>/`, where the images are picked up.
pub fn pio_run(config: &DeployConfig, target: Option<&str>) -> Cmd {
    let cmd = Cmd::new(&config.pio)
        .args(["run", "-e", config.pio_env.as_str()])
        .current_dir(&config.project_dir);
    match target {
        Some(target) => cmd.args(["--target", target]),
        None => cmd,
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with(';') || trimmed.starts_with('#')
}

/// Rewrite the first active `board_build.filesystem = ...` line in `content`.
///
/// Returns `None` when no active line carries the key.
pub fn patch_filesystem(content: &str, backend: &str) -> Option<String> {
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();

    let index = lines
        .iter()
        .position(|line| line.contains(FILESYSTEM_KEY) && !is_comment(line) && line.contains('='))?;

    // Keep CRLF endings intact.
    let eol = if lines[index].ends_with('\r') { "\r" } else { "" };
    lines[index] = format!("{FILESYSTEM_KEY} = {backend}{eol}");
    Some(lines.join("\n"))
}

/// Select `backend` in the config file at `path`.
pub fn set_filesystem(path: &Path, backend: &str) -> Result<()> {
    if !path.is_file() {
        bail!("{} not found!", path.display());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading '{}'", path.display()))?;

    let Some(patched) = patch_filesystem(&content, backend) else {
        bail!("{FILESYSTEM_KEY} not found in {}", path.display());
    };

    fs::write(path, patched).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

/// Currently selected backend, if any active line sets it.
pub fn current_filesystem(path: &Path) -> Result<Option<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading '{}'", path.display()))?;
    Ok(content
        .lines()
        .find(|line| line.contains(FILESYSTEM_KEY) && !is_comment(line) && line.contains('='))
        .and_then(|line| line.split_once('='))
        .map(|(_, value)| value.trim().to_string()))
}

/// Snapshot of a config file taken before it is modified.
///
/// Restoring consumes the snapshot: the backup is copied back over the
/// original and deleted.
#[derive(Debug)]
pub struct ConfigBackup {
    original: PathBuf,
    backup: PathBuf,
}

impl ConfigBackup {
    /// Path of the sibling backup file for `path`.
    pub fn backup_path_for(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    /// Copy `path` to its backup sibling. `None` if `path` does not exist.
    pub fn create(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let backup = Self::backup_path_for(path);
        fs::copy(path, &backup).with_context(|| {
            format!(
                "backing up '{}' to '{}'",
                path.display(),
                backup.display()
            )
        })?;
        Ok(Some(Self {
            original: path.to_path_buf(),
            backup,
        }))
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Put the snapshot back. Returns `false` if the backup had vanished.
    pub fn restore(self) -> Result<bool> {
        if !self.backup.exists() {
            return Ok(false);
        }
        fs::copy(&self.backup, &self.original).with_context(|| {
            format!(
                "restoring '{}' from '{}'",
                self.original.display(),
                self.backup.display()
            )
        })?;
        fs::remove_file(&self.backup)
            .with_context(|| format!("removing backup '{}'", self.backup.display()))?;
        Ok(true)
    }
}
