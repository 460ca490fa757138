//! Gzip compression of the device's web assets.
//!
//! The firmware serves `index.html.gz` and friends straight out of LittleFS,
//! so the sources in `source_data/` are compressed at the highest gzip level
//! before the image is built.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::ui;

/// Web assets packed into the LittleFS image, in processing order.
pub const WEB_ASSETS: &[&str] = &["index.html", "style.css", "script.js"];

const GZIP_LEVEL: Compression = Compression::best();

/// One compressed file and its size accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedAsset {
    pub source: PathBuf,
    pub output: PathBuf,
    pub original_size: u64,
    pub compressed_size: u64,
    reduction_percent: f64,
}

impl CompressedAsset {
    fn new(source: PathBuf, output: PathBuf, original_size: u64, compressed_size: u64) -> Self {
        Self {
            reduction_percent: reduction_percent(original_size, compressed_size),
            source,
            output,
            original_size,
            compressed_size,
        }
    }

    /// `(1 - compressed / original) * 100`, fixed when the asset is created.
    pub fn reduction_percent(&self) -> f64 {
        self.reduction_percent
    }
}

/// `(1 - compressed / original) * 100`; an empty input reports no reduction.
pub fn reduction_percent(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    (1.0 - compressed_size as f64 / original_size as f64) * 100.0
}

/// Outcome of compressing a set of assets.
#[derive(Debug, Clone, Default)]
pub struct CompressReport {
    pub assets: Vec<CompressedAsset>,
    /// Requested names that were not found in the source directory.
    pub missing: Vec<String>,
}

impl CompressReport {
    pub fn total_compressed(&self) -> u64 {
        self.assets.iter().map(|a| a.compressed_size).sum()
    }
}

/// Gzip `input` into `output` at the highest level and report the sizes.
pub fn compress_file(input: &Path, output: &Path) -> Result<CompressedAsset> {
    let data = fs::read(input).with_context(|| format!("reading '{}'", input.display()))?;

    let mut encoder = GzEncoder::new(Vec::new(), GZIP_LEVEL);
    encoder
        .write_all(&data)
        .with_context(|| format!("compressing '{}'", input.display()))?;
    let compressed = encoder
        .finish()
        .with_context(|| format!("finishing gzip stream for '{}'", input.display()))?;

    fs::write(output, &compressed)
        .with_context(|| format!("writing '{}'", output.display()))?;

    let asset = CompressedAsset::new(
        input.to_path_buf(),
        output.to_path_buf(),
        data.len() as u64,
        compressed.len() as u64,
    );
    println!(
        "{}: {} bytes -> {} bytes ({:.1}% reduction)",
        input.display(),
        ui::thousands(asset.original_size),
        ui::thousands(asset.compressed_size),
        asset.reduction_percent()
    );
    Ok(asset)
}

/// Compress each of `names` found in `source_dir` into `output_dir/<name>.gz`.
///
/// Missing names are warned about and skipped.
pub fn compress_assets(source_dir: &Path, output_dir: &Path, names: &[&str]) -> Result<CompressReport> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory '{}'", output_dir.display()))?;

    println!("Compressing web files for LittleFS...");
    println!("{}", ui::rule());

    let mut report = CompressReport::default();
    for name in names {
        let input = source_dir.join(name);
        if !input.is_file() {
            ui::warning(&format!(
                "{name} not found in {} directory",
                source_dir.display()
            ));
            report.missing.push(name.to_string());
            continue;
        }
        println!("Compressing {name}...");
        let output = output_dir.join(format!("{name}.gz"));
        report.assets.push(compress_file(&input, &output)?);
    }

    print_summary(&report, output_dir);
    Ok(report)
}

/// Compress every regular file directly under `source_dir`, sorted by name.
pub fn compress_directory(source_dir: &Path, output_dir: &Path) -> Result<CompressReport> {
    let mut names = Vec::new();
    for entry in fs::read_dir(source_dir)
        .with_context(|| format!("reading source directory '{}'", source_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("reading entry in '{}'", source_dir.display()))?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        names.push(name);
    }
    names.sort();

    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    compress_assets(source_dir, output_dir, &names)
}

fn print_summary(report: &CompressReport, output_dir: &Path) {
    println!("{}", ui::rule());
    println!(
        "\nTotal compressed size: {} bytes",
        ui::thousands(report.total_compressed())
    );
    println!("Output directory: {}", output_dir.display());
}

/// True when `dir` exists and holds at least one `.gz` file.
pub fn has_gzip_output(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|e| {
        e.path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
    })
}
