use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::DeployConfig;
use crate::pipeline::staging;
use crate::platformio::ConfigBackup;
use crate::ui;

/// What cleanup actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub config_restored: bool,
    pub staging_removed: bool,
}

/// Resources a deployment holds while it runs: at most one pending
/// `platformio.ini` snapshot, and the staging directory.
///
/// [`PipelineRun::cleanup`] releases both on every exit path; dropping an
/// uncleaned run does the same.
#[derive(Debug)]
pub struct PipelineRun {
    ini: PathBuf,
    staging: PathBuf,
    backup: Option<ConfigBackup>,
    cleaned: bool,
}

impl PipelineRun {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            ini: config.ini_path(),
            staging: config.staging_path(),
            backup: None,
            cleaned: false,
        }
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    pub fn has_pending_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Snapshot the config as it is right now.
    ///
    /// A snapshot left by an earlier stage is restored first, so the new one
    /// reflects the pristine file and only one backup ever exists.
    pub fn backup_config(&mut self) -> Result<()> {
        if let Some(previous) = self.backup.take() {
            previous.restore()?;
        }
        println!("Backing up {}...", file_label(&self.ini));
        self.backup = ConfigBackup::create(&self.ini)?;
        Ok(())
    }

    /// Restore the pending snapshot and remove the staging directory.
    ///
    /// Each step is best-effort: a failure is printed and the next step still
    /// runs. Calling this twice is harmless.
    pub fn cleanup(&mut self) -> CleanupReport {
        self.cleaned = true;
        let mut report = CleanupReport::default();

        if let Some(backup) = self.backup.take() {
            match backup.restore() {
                Ok(true) => {
                    ui::success(&format!("Restored {}", file_label(&self.ini)));
                    report.config_restored = true;
                }
                Ok(false) => {}
                Err(err) => ui::error(&format!("Could not restore config: {err:#}")),
            }
        }

        match staging::remove(&self.staging) {
            Ok(true) => {
                ui::success(&format!(
                    "Removed temporary {}/ directory",
                    file_label(&self.staging)
                ));
                report.staging_removed = true;
            }
            Ok(false) => {}
            Err(err) => ui::error(&format!("Could not remove staging directory: {err:#}")),
        }

        report
    }
}

impl Drop for PipelineRun {
    fn drop(&mut self) {
        if !self.cleaned {
            self.cleanup();
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
