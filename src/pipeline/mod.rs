//! The five-stage deployment.
//!
//! ```text
//! compress → build_firmware → upload_firmware → deploy_littlefs → deploy_ffat
//! ```
//!
//! Each stage runs only if the previous one succeeded. Whatever happens,
//! success, a failed stage or Ctrl+C, the run ends in
//! [`PipelineRun::cleanup`], which puts `platformio.ini` back and removes the
//! staging directory.

pub mod lock;
pub mod manifest;
pub mod run;
pub mod staging;

use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::compress::{self, WEB_ASSETS};
use crate::config::DeployConfig;
use crate::flash::{self, format_offset, PortScanner};
use crate::image::{self, FilesystemKind};
use crate::platformio;
use crate::process::CommandRunner;
use crate::signal::{is_interrupted, InterruptFlag, Interrupted};
use crate::ui;

pub use lock::RunLock;
pub use manifest::{ImageRecord, RunManifest, RunStatus};
pub use run::{CleanupReport, PipelineRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compress,
    BuildFirmware,
    UploadFirmware,
    DeployLittleFs,
    DeployFfat,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Compress,
        Stage::BuildFirmware,
        Stage::UploadFirmware,
        Stage::DeployLittleFs,
        Stage::DeployFfat,
    ];

    /// 1-based position in [`Stage::ALL`].
    pub fn number(self) -> usize {
        match self {
            Stage::Compress => 1,
            Stage::BuildFirmware => 2,
            Stage::UploadFirmware => 3,
            Stage::DeployLittleFs => 4,
            Stage::DeployFfat => 5,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Stage::Compress => "compress",
            Stage::BuildFirmware => "build_firmware",
            Stage::UploadFirmware => "upload_firmware",
            Stage::DeployLittleFs => "deploy_littlefs",
            Stage::DeployFfat => "deploy_ffat",
        }
    }

    /// Stages after which the device reboots and needs a pause.
    pub fn settles_after(self) -> bool {
        matches!(self, Stage::UploadFirmware | Stage::DeployLittleFs)
    }

    pub fn title(self) -> &'static str {
        match self {
            Stage::Compress => "Compressing web files",
            Stage::BuildFirmware => "Compiling firmware",
            Stage::UploadFirmware => "Uploading firmware",
            Stage::DeployLittleFs => "Uploading LittleFS (Web files)",
            Stage::DeployFfat => "Uploading FFat (Agent files)",
        }
    }
}

/// Drives a deployment against one project.
pub struct Deployer<'a> {
    config: &'a DeployConfig,
    runner: &'a dyn CommandRunner,
    ports: &'a dyn PortScanner,
    interrupt: InterruptFlag,
}

impl<'a> Deployer<'a> {
    pub fn new(
        config: &'a DeployConfig,
        runner: &'a dyn CommandRunner,
        ports: &'a dyn PortScanner,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            config,
            runner,
            ports,
            interrupt,
        }
    }

    /// Run every stage, then clean up and record the run manifest.
    ///
    /// Returns the manifest on success. On failure the error is returned
    /// after cleanup has finished; an interruption surfaces as
    /// [`Interrupted`]. Every returned error has already been printed.
    pub fn run(&self) -> Result<RunManifest> {
        ui::banner(&["NOOX Device Deployment", "Automated Dual Filesystem Deployment"]);

        let _lock = match RunLock::acquire(&self.config.state_dir()) {
            Ok(lock) => lock,
            Err(err) => {
                ui::error(&format!("{err:#}"));
                return Err(err);
            }
        };
        let mut run = PipelineRun::new(self.config);
        let mut manifest = RunManifest::start();

        let result = self.run_stages(&mut run, &mut manifest);

        match &result {
            Ok(()) => {
                manifest.finish(RunStatus::Success);
                ui::outcome_banner(true, "✓ Deployment Complete!");
                ui::note("\nNext steps:");
                println!("1. Open serial monitor: {} device monitor", self.config.pio);
                println!("2. Check device logs for successful initialization");
                println!("3. Connect device WiFi and access web interface");
            }
            Err(err) if is_interrupted(err) => {
                manifest.finish(RunStatus::Interrupted);
                manifest.error = Some(err.to_string());
                ui::interrupted(&err.to_string());
            }
            Err(err) => {
                manifest.finish(RunStatus::Failed);
                manifest.error = Some(format!("{err:#}"));
                ui::outcome_banner(false, "✗ Deployment Failed!");
                println!("\nError: {err:#}");
                println!("\nRolling back changes...");
            }
        }

        println!("\nCleaning up...");
        run.cleanup();
        println!("\nCleanup complete.");

        let manifest_path = RunManifest::path_in(&self.config.state_dir());
        if let Err(err) = manifest.write(&manifest_path) {
            ui::warning(&format!("{err:#}"));
        }

        result.map(|()| manifest)
    }

    fn run_stages(&self, run: &mut PipelineRun, manifest: &mut RunManifest) -> Result<()> {
        for stage in Stage::ALL {
            self.interrupt.check()?;
            ui::step(stage.number(), Stage::ALL.len(), stage.title());

            if let Err(err) = self.run_stage(stage, run, manifest) {
                manifest.failed_stage = Some(stage.slug().to_string());
                // A tool killed by Ctrl+C reports a plain failure.
                if self.interrupt.is_set() {
                    return Err(Interrupted.into());
                }
                return Err(err);
            }
            manifest.completed_stages.push(stage.slug().to_string());

            // Ctrl+C while settling interrupts the run without failing the stage.
            if stage.settles_after() {
                self.settle()?;
            }
        }
        Ok(())
    }

    fn run_stage(
        &self,
        stage: Stage,
        run: &mut PipelineRun,
        manifest: &mut RunManifest,
    ) -> Result<()> {
        match stage {
            Stage::Compress => self.compress(),
            Stage::BuildFirmware => {
                self.pio(None, "Compile firmware")
                    .context("Failed to compile firmware")?;
                ui::success("Firmware compiled successfully");
                Ok(())
            }
            Stage::UploadFirmware => {
                self.pio(Some("upload"), "Upload firmware to device")
                    .context("Failed to upload firmware")?;
                ui::success("Firmware uploaded successfully");
                Ok(())
            }
            Stage::DeployLittleFs => self.deploy_filesystem(FilesystemKind::LittleFs, run, manifest),
            Stage::DeployFfat => self.deploy_filesystem(FilesystemKind::FFat, run, manifest),
        }
    }

    fn compress(&self) -> Result<()> {
        let output = self.config.littlefs_path();
        compress::compress_assets(&self.config.source_path(), &output, WEB_ASSETS)
            .context("Failed to compress web files")?;

        if !compress::has_gzip_output(&output) {
            bail!("{}/ directory is empty or missing", output.display());
        }
        ui::success("Web files compressed successfully");
        Ok(())
    }

    fn pio(&self, target: Option<&str>, description: &str) -> Result<()> {
        platformio::pio_run(self.config, target)
            .description(description)
            .run(self.runner)?;
        Ok(())
    }

    /// Backup, patch, stage, build, verify and flash one filesystem.
    fn deploy_filesystem(
        &self,
        kind: FilesystemKind,
        run: &mut PipelineRun,
        manifest: &mut RunManifest,
    ) -> Result<()> {
        run.backup_config()?;

        let ini = self.config.ini_path();
        platformio::set_filesystem(&ini, kind.backend()).with_context(|| {
            format!("Failed to modify platformio.ini for {}", kind.backend())
        })?;
        ui::success(&format!("Set filesystem to: {}", kind.backend()));

        let source = self.config.image_source(kind);
        if !source.is_dir() {
            ui::warning(&format!(
                "{}/ directory not found, skipping...",
                source.display()
            ));
        }
        println!(
            "Copying {}/ to {}/...",
            source.display(),
            run.staging().display()
        );
        staging::repopulate(run.staging(), &source)?;
        self.interrupt.check()?;

        let image = image::build_image(self.config, self.runner, kind)?;
        let check = image::verify_image(&image, kind)?;
        manifest.images.push(ImageRecord::new(kind, &check));
        self.interrupt.check()?;

        flash::flash_image(
            self.config,
            self.runner,
            self.ports,
            kind.label(),
            kind.flash_offset(),
            &image,
        )?;
        ui::success(&format!(
            "{} uploaded successfully to {}",
            kind.label(),
            format_offset(kind.flash_offset())
        ));
        Ok(())
    }

    /// Give the device time to reboot after a flash.
    fn settle(&self) -> Result<()> {
        if self.config.settle_delay > Duration::ZERO {
            std::thread::sleep(self.config.settle_delay);
        }
        self.interrupt.check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let numbers: Vec<usize> = Stage::ALL.iter().map(|s| s.number()).collect();
        assert_eq!(numbers, [1, 2, 3, 4, 5]);
        assert_eq!(Stage::ALL[3].slug(), "deploy_littlefs");
    }

    #[test]
    fn test_settle_follows_flashing_stages() {
        let settling: Vec<&str> = Stage::ALL
            .iter()
            .filter(|s| s.settles_after())
            .map(|s| s.slug())
            .collect();
        assert_eq!(settling, ["upload_firmware", "deploy_littlefs"]);
    }

    #[test]
    fn test_stage_titles_unique() {
        let mut titles: Vec<&str> = Stage::ALL.iter().map(|s| s.title()).collect();
        titles.sort();
        titles.dedup();
        assert_eq!(titles.len(), Stage::ALL.len());
    }
}
